//! Path-match / rewrite (spec §4.7).
//!
//! The teacher has nothing resembling a path router (`maker_web` hands a
//! raw path string straight to the handler), so this is grounded instead
//! on the `regex` crate's own `Captures` API and the substitution rule
//! spec'd directly: `$0`..`$9` reference capture groups, `$` followed by
//! a non-digit is a literal `$`.

use crate::errors::RouteError;
use regex::Regex;

/// The outcome of matching a request path against the configured
/// pattern: an ordered list of captured groups, index 0 being the whole
/// match. When no pattern is configured (`LWS_MATCH` unset, "match all"),
/// this is a single synthetic group holding the entire path.
pub struct RouteMatch {
    groups: Vec<Option<String>>,
}

/// Matches `path` against `pattern`. `pattern = None` means "match
/// everything" (spec §6: "unset ⇒ match all").
pub fn match_path(pattern: Option<&Regex>, path: &str) -> Result<RouteMatch, RouteError> {
    match pattern {
        None => Ok(RouteMatch {
            groups: vec![Some(path.to_string())],
        }),
        Some(re) => {
            let caps = re.captures(path).ok_or(RouteError::NoMatch)?;
            let groups = (0..caps.len())
                .map(|i| caps.get(i).map(|m| m.as_str().to_string()))
                .collect();
            Ok(RouteMatch { groups })
        }
    }
}

impl RouteMatch {
    /// Substitutes `$0`..`$9` into `template`. A `$` immediately followed
    /// by a digit that has no corresponding (or unmatched) capture group
    /// fails the whole substitution (spec §4.7: "missing groups cause
    /// failure").
    pub fn substitute(&self, template: &str) -> Result<String, RouteError> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }

            match chars.peek().copied() {
                Some(d) if d.is_ascii_digit() => {
                    chars.next();
                    let idx = d.to_digit(10).unwrap() as usize;
                    let group = self
                        .groups
                        .get(idx)
                        .and_then(|g| g.as_deref())
                        .ok_or(RouteError::NoMatch)?;
                    out.push_str(group);
                }
                _ => out.push('$'),
            }
        }

        Ok(out)
    }
}

/// Computes the filesystem path for the main chunk: `{task_root}/{main}`
/// with `main` rewritten from `main_template` (spec §4.7: "the resulting
/// `main` is prefixed by `{task_root}/`").
pub fn resolve_main_file(
    task_root: &str,
    main_template: &str,
    route: &RouteMatch,
) -> Result<String, RouteError> {
    let rewritten = route.substitute(main_template)?;
    Ok(format!("{task_root}/{rewritten}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_numbered_groups() {
        let re = Regex::new(r"^/users/([0-9]+)/?$").unwrap();
        let route = match_path(Some(&re), "/users/42").unwrap();
        assert_eq!(
            resolve_main_file("/var/task", "user_$1.lua", &route).unwrap(),
            "/var/task/user_42.lua"
        );
    }

    #[test]
    fn literal_dollar_before_non_digit() {
        let route = match_path(None, "/anything").unwrap();
        assert_eq!(route.substitute("price_$$5.lua").unwrap(), "price_$5.lua");
    }

    #[test]
    fn unmatched_path_is_no_match() {
        let re = Regex::new(r"^/users/([0-9]+)$").unwrap();
        assert_eq!(match_path(Some(&re), "/other").unwrap_err(), RouteError::NoMatch);
    }

    #[test]
    fn missing_group_fails_substitution() {
        let re = Regex::new(r"^/a(/b)?$").unwrap();
        let route = match_path(Some(&re), "/a").unwrap();
        assert_eq!(route.substitute("$1.lua").unwrap_err(), RouteError::NoMatch);
    }

    #[test]
    fn no_pattern_matches_whole_path() {
        let route = match_path(None, "/hello").unwrap();
        assert_eq!(route.substitute("hello.lua").unwrap(), "hello.lua");
    }
}
