// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Filesystem seam. The engine never touches the OS directly; everything
//! goes through [`FileSystem`] so embedders can substitute an in-memory
//! tree for tests or a sandboxed view for hermetic builds.
//!
//! Implementations must be thread-safe: the parse walker and the glob cache
//! call into them from multiple worker threads.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use parking_lot::RwLock;

use crate::error::BlueprintError;

/// Subset of stat information the engine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub is_dir: bool,
    pub size: u64,
}

pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file, addressed relative to the
    /// source root.
    fn open(&self, path: &str) -> io::Result<Vec<u8>>;

    fn exists(&self, path: &str) -> bool;

    /// Expands a glob pattern into the sorted list of matching paths.
    /// `*` does not cross directory separators; `**` does.
    fn glob(&self, pattern: &str) -> Result<Vec<String>, BlueprintError>;

    fn lstat(&self, path: &str) -> io::Result<FileInfo>;
}

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

pub(crate) fn compile_pattern(pattern: &str) -> Result<Pattern, BlueprintError> {
    Pattern::new(pattern).map_err(|e| BlueprintError::GlobPattern {
        pattern: pattern.to_string(),
        message: e.msg.to_string(),
    })
}

/// Real filesystem rooted at a source directory. Paths handed to the engine
/// are always relative to that root.
pub struct OsFileSystem {
    root: PathBuf,
}

impl OsFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn absolute(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn relative(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }
}

impl FileSystem for OsFileSystem {
    fn open(&self, path: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.absolute(path))
    }

    fn exists(&self, path: &str) -> bool {
        self.absolute(path).exists()
    }

    fn glob(&self, pattern: &str) -> Result<Vec<String>, BlueprintError> {
        let full = self.absolute(pattern);
        let full = full.to_string_lossy();
        let walker = glob::glob_with(&full, match_options()).map_err(|e| {
            BlueprintError::GlobPattern {
                pattern: pattern.to_string(),
                message: e.msg.to_string(),
            }
        })?;
        let mut matches = Vec::new();
        for entry in walker.flatten() {
            if let Some(rel) = self.relative(&entry) {
                matches.push(rel);
            }
        }
        matches.sort();
        Ok(matches)
    }

    fn lstat(&self, path: &str) -> io::Result<FileInfo> {
        let meta = std::fs::symlink_metadata(self.absolute(path))?;
        Ok(FileInfo {
            is_dir: meta.is_dir(),
            size: meta.len(),
        })
    }
}

/// In-memory filesystem for tests and hermetic embedders. Directories are
/// implied by the files placed under them.
#[derive(Default)]
pub struct MemFileSystem {
    files: RwLock<indexmap::IndexMap<String, Vec<u8>>>,
}

impl MemFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> &Self {
        self.files.write().insert(path.into(), contents.into());
        self
    }

    fn directories(&self) -> BTreeSet<String> {
        let files = self.files.read();
        let mut dirs = BTreeSet::new();
        for path in files.keys() {
            let mut current = Path::new(path);
            while let Some(parent) = current.parent() {
                if parent.as_os_str().is_empty() {
                    break;
                }
                dirs.insert(parent.to_string_lossy().replace('\\', "/"));
                current = parent;
            }
        }
        dirs
    }
}

impl FileSystem for MemFileSystem {
    fn open(&self, path: &str) -> io::Result<Vec<u8>> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{path}: not found")))
    }

    fn exists(&self, path: &str) -> bool {
        self.files.read().contains_key(path) || self.directories().contains(path)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<String>, BlueprintError> {
        let compiled = compile_pattern(pattern)?;
        let options = match_options();
        let mut matches: Vec<String> = self
            .files
            .read()
            .keys()
            .filter(|path| compiled.matches_with(path, options))
            .cloned()
            .collect();
        for dir in self.directories() {
            if compiled.matches_with(&dir, options) {
                matches.push(dir);
            }
        }
        matches.sort();
        matches.dedup();
        Ok(matches)
    }

    fn lstat(&self, path: &str) -> io::Result<FileInfo> {
        if let Some(contents) = self.files.read().get(path) {
            return Ok(FileInfo {
                is_dir: false,
                size: contents.len() as u64,
            });
        }
        if self.directories().contains(path) {
            return Ok(FileInfo {
                is_dir: true,
                size: 0,
            });
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{path}: not found"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rstest::rstest]
    // A single star does not cross directory separators.
    #[case("*/[xy].c", &["a/x.c", "b/y.c"])]
    #[case("a/*.c", &["a/x.c"])]
    #[case("a/**/*.c", &["a/sub/z.c", "a/x.c"])]
    #[case("*.c", &[])]
    fn mem_fs_glob_is_sorted_and_separator_aware(
        #[case] pattern: &str,
        #[case] expected: &[&str],
    ) {
        let fs = MemFileSystem::new();
        fs.add("b/y.c", "");
        fs.add("a/x.c", "");
        fs.add("a/sub/z.c", "");

        let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        assert_eq!(fs.glob(pattern).unwrap(), expected);
    }

    #[test]
    fn mem_fs_implies_directories() {
        let fs = MemFileSystem::new();
        fs.add("pkg/lib/Blueprints", "x");
        assert!(fs.exists("pkg"));
        assert!(fs.exists("pkg/lib"));
        assert!(fs.lstat("pkg/lib").unwrap().is_dir);
        assert!(!fs.lstat("pkg/lib/Blueprints").unwrap().is_dir);
    }

    #[test]
    fn os_fs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.c"), b"int main;").unwrap();

        let fs = OsFileSystem::new(dir.path());
        assert!(fs.exists("src/main.c"));
        assert_eq!(fs.open("src/main.c").unwrap(), b"int main;");
        assert_eq!(fs.glob("src/*.c").unwrap(), vec!["src/main.c".to_string()]);
    }
}
