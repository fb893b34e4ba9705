//! Stat cache (spec §4.8).
//!
//! Built directly on [`crate::table::Table`], matching the teacher's
//! pattern of composing the ordered-table primitive for more than one
//! purpose within the same crate (there: header map; here: filename →
//! existence memo).

use crate::table::{Table, TablePolicy};
use std::fs;

/// Tri-state result of a filename lookup. `Unknown` is never actually
/// stored — an absent table entry already means "unknown, not yet
/// resolved" (spec §4.8: "the cache is populated on first lookup").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatResult {
    Found,
    NotFound,
}

/// Memoises `{UNKNOWN, FOUND, NOT_FOUND}` per absolute filename, bounded
/// by a FIFO-evicting capacity (default 1024, spec §4.8).
pub struct StatCache {
    entries: Table<StatResult>,
}

impl StatCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Table::new(TablePolicy {
                case_insensitive: false,
                capacity: Some(capacity),
            }),
        }
    }

    /// Returns whether `path` names a regular file, consulting (and
    /// populating) the cache. A previous `NotFound` or `Found` result is
    /// returned without touching the filesystem again.
    pub fn is_regular_file(&mut self, path: &str) -> bool {
        if let Some(result) = self.entries.get(path) {
            return *result == StatResult::Found;
        }

        let result = match fs::metadata(path) {
            Ok(meta) if meta.is_file() => StatResult::Found,
            _ => StatResult::NotFound,
        };
        self.entries.insert(path, result);
        result == StatResult::Found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn caches_a_positive_lookup() {
        let mut file = tempfile_in_current_dir();
        writeln!(file.1, "x").unwrap();
        let mut cache = StatCache::new(4);
        assert!(cache.is_regular_file(&file.0));
        // Removing the file doesn't change the cached answer.
        std::fs::remove_file(&file.0).unwrap();
        assert!(cache.is_regular_file(&file.0));
    }

    #[test]
    fn missing_file_is_not_found() {
        let mut cache = StatCache::new(4);
        assert!(!cache.is_regular_file("/nonexistent/path/definitely-not-here"));
    }

    #[test]
    fn eviction_forces_recheck() {
        let mut cache = StatCache::new(1);
        cache.is_regular_file("/does/not/exist/a");
        cache.is_regular_file("/does/not/exist/b");
        // `a`'s entry was evicted; this just shouldn't panic and should
        // still resolve to NotFound.
        assert!(!cache.is_regular_file("/does/not/exist/a"));
    }

    fn tempfile_in_current_dir() -> (String, std::fs::File) {
        let path = format!("{}/statcache_test_{}.tmp", std::env::temp_dir().display(), std::process::id());
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
