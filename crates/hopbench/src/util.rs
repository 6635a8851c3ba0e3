use std::fs;

use anyhow::Result;
use chrono::NaiveDateTime;
use glob::{glob_with, MatchOptions};

/// Leftovers of the hop client from an interrupted run.
pub const STALE_TEMP_PATTERN: &str = "/tmp/hop*";

/// Local wall-clock time for result rows.
pub fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Removes every file or directory matching `pattern`. Entries that cannot
/// be removed are logged and skipped. Returns how many were removed.
pub fn purge_temp_files(pattern: &str) -> Result<usize> {
    let options = MatchOptions {
        require_literal_leading_dot: true,
        ..MatchOptions::new()
    };
    let mut removed = 0;
    for path in glob_with(pattern, options)?.flatten() {
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "could not remove stale file")
            }
        }
    }
    if removed > 0 {
        tracing::info!(pattern, removed, "purged stale temporary files");
    }
    Ok(removed)
}
