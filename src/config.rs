//! Runtime configuration.
//!
//! Mirrors the teacher's `limits` module: plain public-field structs with
//! a `Default` impl, each field documented with its default and the knob
//! that controls it — except here the knob is an environment variable
//! (spec §6) rather than a `ServerBuilder` method, since this process is
//! configured once at startup rather than per connection.

use crate::errors::ConfigError;
use regex::Regex;
use std::env;
use std::time::Duration;

/// Startup configuration read once from the environment (spec §6).
///
/// Immutable for the lifetime of the process once constructed by
/// [`RuntimeConfig::from_env`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `AWS_LAMBDA_RUNTIME_API` — platform API host:port (required).
    pub runtime_api: String,
    /// `LAMBDA_TASK_ROOT` — base directory for script file resolution (required).
    pub task_root: String,
    /// `LWS_MATCH` — path matcher; `None` matches every path.
    pub match_regex: Option<Regex>,
    /// `LWS_MAIN` — main chunk filename template, `$0..$9` allowed (required).
    pub main_template: String,
    /// `LWS_PATH_INFO` — path-info template.
    pub path_info_template: Option<String>,
    /// `LWS_INIT` — optional init chunk filename.
    pub init_chunk: Option<String>,
    /// `LWS_PRE` — optional pre chunk filename.
    pub pre_chunk: Option<String>,
    /// `LWS_POST` — optional post chunk filename.
    pub post_chunk: Option<String>,
    /// `LWS_RAW` — raw passthrough mode (default `off`).
    pub raw: bool,
    /// `LWS_GC` — explicit-GC byte threshold (default: disabled, `0`).
    pub gc_threshold: usize,
    /// `LWS_REQ_MAX` — requests served per interpreter state before
    /// recycling (default: unbounded, `usize::MAX`).
    pub max_requests_per_state: usize,
    /// `LWS_DIAGNOSTIC` — include script error text in the error envelope
    /// (default `off`).
    pub diagnostic: bool,
    /// `LWS_LOG_LEVEL` — minimum log level (default `info`).
    pub log_level: LogLevel,
    /// `LWS_LOG_FORMAT` — `text` or `json` (default `text`).
    pub log_format: LogFormat,

    /// Connect timeout for all platform-API calls (spec §4.4: 1 second,
    /// fixed — not independently configurable, listed here so every HTTP
    /// client construction point reads it from one place).
    pub connect_timeout: Duration,
    /// Maximum number of entries in the stat cache before FIFO eviction
    /// (spec §4.8 default: 1024).
    pub stat_cache_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Emerg,
    Alert,
    Crit,
    Err,
    Warn,
    Notice,
    Info,
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let runtime_api = require_str("AWS_LAMBDA_RUNTIME_API")?;
        let task_root = require_str("LAMBDA_TASK_ROOT")?;
        let main_template = require_str("LWS_MAIN")?;

        let match_regex = match optional_str("LWS_MATCH") {
            Some(pattern) => Some(Regex::new(&pattern)?),
            None => None,
        };

        Ok(Self {
            runtime_api,
            task_root,
            match_regex,
            main_template,
            path_info_template: optional_str("LWS_PATH_INFO"),
            init_chunk: optional_str("LWS_INIT"),
            pre_chunk: optional_str("LWS_PRE"),
            post_chunk: optional_str("LWS_POST"),
            raw: parse_flag("LWS_RAW")?.unwrap_or(false),
            gc_threshold: parse_size("LWS_GC")?.unwrap_or(0),
            max_requests_per_state: parse_int("LWS_REQ_MAX")?.unwrap_or(usize::MAX),
            diagnostic: parse_flag("LWS_DIAGNOSTIC")?.unwrap_or(false),
            log_level: parse_log_level()?,
            log_format: parse_log_format()?,
            connect_timeout: Duration::from_secs(1),
            stat_cache_capacity: 1024,
        })
    }
}

fn optional_str(name: &'static str) -> Option<String> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => None,
    }
}

fn require_str(name: &'static str) -> Result<String, ConfigError> {
    optional_str(name).ok_or(ConfigError::MissingRequired(name))
}

fn parse_flag(name: &'static str) -> Result<Option<bool>, ConfigError> {
    match optional_str(name) {
        None => Ok(None),
        Some(v) if v == "on" => Ok(Some(true)),
        Some(v) if v == "off" => Ok(Some(false)),
        Some(value) => Err(ConfigError::InvalidValue { name, value }),
    }
}

fn parse_int(name: &'static str) -> Result<Option<usize>, ConfigError> {
    match optional_str(name) {
        None => Ok(None),
        Some(value) => value
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}

/// Parses a byte size with an optional `k`/`m` suffix, matching the
/// original `lws_getenv_size` (`lws_runtime.c`): base value times 1024 for
/// `k`, 1024*1024 for `m`, overflow-checked.
fn parse_size(name: &'static str) -> Result<Option<usize>, ConfigError> {
    let Some(value) = optional_str(name) else {
        return Ok(None);
    };

    let (digits, mult) = match value.as_bytes().last() {
        Some(b'k') => (&value[..value.len() - 1], 1024usize),
        Some(b'm') => (&value[..value.len() - 1], 1024 * 1024),
        _ => (value.as_str(), 1usize),
    };

    let base: usize = digits
        .parse()
        .map_err(|_| ConfigError::InvalidSize { name, value: value.clone() })?;
    let result = base
        .checked_mul(mult)
        .ok_or_else(|| ConfigError::InvalidSize { name, value: value.clone() })?;

    Ok(Some(result))
}

fn parse_log_level() -> Result<LogLevel, ConfigError> {
    Ok(match optional_str("LWS_LOG_LEVEL").as_deref() {
        None | Some("info") => LogLevel::Info,
        Some("emerg") => LogLevel::Emerg,
        Some("alert") => LogLevel::Alert,
        Some("crit") => LogLevel::Crit,
        Some("err") => LogLevel::Err,
        Some("warn") => LogLevel::Warn,
        Some("notice") => LogLevel::Notice,
        Some("debug") => LogLevel::Debug,
        Some(value) => {
            return Err(ConfigError::InvalidValue {
                name: "LWS_LOG_LEVEL",
                value: value.to_string(),
            })
        }
    })
}

fn parse_log_format() -> Result<LogFormat, ConfigError> {
    Ok(match optional_str("LWS_LOG_FORMAT").as_deref() {
        None | Some("text") => LogFormat::Text,
        Some("json") => LogFormat::Json,
        Some(value) => {
            return Err(ConfigError::InvalidValue {
                name: "LWS_LOG_FORMAT",
                value: value.to_string(),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_suffixes() {
        std::env::set_var("LWS_GC_TEST_K", "4k");
        assert_eq!(parse_size("LWS_GC_TEST_K").unwrap(), Some(4096));
        std::env::remove_var("LWS_GC_TEST_K");

        std::env::set_var("LWS_GC_TEST_M", "2m");
        assert_eq!(parse_size("LWS_GC_TEST_M").unwrap(), Some(2 * 1024 * 1024));
        std::env::remove_var("LWS_GC_TEST_M");

        std::env::set_var("LWS_GC_TEST_PLAIN", "512");
        assert_eq!(parse_size("LWS_GC_TEST_PLAIN").unwrap(), Some(512));
        std::env::remove_var("LWS_GC_TEST_PLAIN");
    }

    #[test]
    fn parse_size_rejects_bad_suffix() {
        std::env::set_var("LWS_GC_TEST_BAD", "4g");
        assert!(parse_size("LWS_GC_TEST_BAD").is_err());
        std::env::remove_var("LWS_GC_TEST_BAD");
    }
}
