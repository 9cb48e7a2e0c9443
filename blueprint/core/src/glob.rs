// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic, race-safe memoization of glob expansions.
//!
//! Every expansion that reaches the manifest must be reproducible, so the
//! cache double-checks: when two threads race to resolve the same key the
//! last writer wins, but a mismatch between the two results panics. A
//! non-deterministic filesystem seam is an engine-breaking bug, not an
//! error to report.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use twox_hash::XxHash64;

use crate::error::BlueprintError;
use crate::fs::{compile_pattern, FileSystem};

/// Keys longer than this are collapsed to a hash. Derived keys double as
/// dep-file names downstream, so they must stay under path-component
/// limits.
const MAX_KEY_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobResult {
    pub pattern: String,
    pub excludes: Vec<String>,
    pub matches: Vec<String>,
}

pub(crate) struct GlobCache {
    entries: Mutex<HashMap<String, Arc<GlobResult>>>,
}

pub(crate) fn glob_cache_key(pattern: &str, excludes: &[String]) -> String {
    let mut key = pattern.to_string();
    for exclude in excludes {
        key.push('|');
        key.push_str(exclude);
    }
    if key.len() > MAX_KEY_LEN {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key.as_bytes());
        key = format!("{}@{:016x}", pattern, hasher.finish());
    }
    key
}

impl GlobCache {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Expands `pattern`, drops matches covered by `excludes`, and returns
    /// a copy of the sorted result. Results are memoized per (pattern,
    /// excludes) key.
    pub(crate) fn glob(
        &self,
        fs: &dyn FileSystem,
        pattern: &str,
        excludes: &[String],
    ) -> Result<GlobResult, BlueprintError> {
        let key = glob_cache_key(pattern, excludes);

        if let Some(cached) = self.entries.lock().get(&key) {
            return Ok(GlobResult::clone(cached));
        }

        // Resolve outside the lock; globbing may hit the real filesystem.
        let mut matches = fs.glob(pattern)?;
        if !excludes.is_empty() {
            let compiled = excludes
                .iter()
                .map(|e| compile_pattern(e))
                .collect::<Result<Vec<_>, _>>()?;
            matches.retain(|m| !compiled.iter().any(|p| p.matches(m)));
        }
        matches.sort();

        let result = Arc::new(GlobResult {
            pattern: pattern.to_string(),
            excludes: excludes.to_vec(),
            matches,
        });

        let mut entries = self.entries.lock();
        if let Some(previous) = entries.insert(key.clone(), result.clone()) {
            // Raced with another resolver. Last writer wins, but the two
            // expansions must agree.
            if *previous != *result {
                panic!(
                    "glob mismatch for key {key:?}: {:?} vs {:?}",
                    previous.matches, result.matches
                );
            }
            debug!(key = %key, "glob cache race resolved identically");
        }

        Ok(GlobResult::clone(&result))
    }

    /// The cache keys resolved so far, sorted. Each key corresponds to one
    /// expansion the emitted manifest depends on.
    pub(crate) fn sorted_keys(&self) -> Vec<String> {
        let entries = self.entries.lock();
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFileSystem;

    fn test_fs() -> MemFileSystem {
        let fs = MemFileSystem::new();
        fs.add("src/a.c", "");
        fs.add("src/b.c", "");
        fs.add("src/b_test.c", "");
        fs
    }

    #[test]
    fn glob_applies_excludes_and_sorts() {
        let fs = test_fs();
        let cache = GlobCache::new();
        let result = cache
            .glob(&fs, "src/*.c", &["src/*_test.c".to_string()])
            .unwrap();
        assert_eq!(
            result.matches,
            vec!["src/a.c".to_string(), "src/b.c".to_string()]
        );
    }

    #[test]
    fn repeated_globs_hit_the_cache() {
        let fs = test_fs();
        let cache = GlobCache::new();
        let first = cache.glob(&fs, "src/*.c", &[]).unwrap();
        // Mutating the filesystem after the first expansion must not change
        // the memoized answer.
        fs.add("src/late.c", "");
        let second = cache.glob(&fs, "src/*.c", &[]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn oversized_keys_are_hash_collapsed() {
        let excludes: Vec<String> = (0..40).map(|i| format!("exclude/pattern/{i}")).collect();
        let key = glob_cache_key("src/*.c", &excludes);
        assert!(key.len() <= MAX_KEY_LEN);
        assert!(key.starts_with("src/*.c@"));

        let short = glob_cache_key("src/*.c", &[]);
        assert_eq!(short, "src/*.c");
    }
}
