//! Reference file lookup.

use globset::{Glob, GlobBuilder};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A file path both absolute and relative to some root directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FilePath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Error type for reference lookup.
#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    /// A pattern is not a valid glob.
    #[error("invalid reference pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
    /// The reference directory could not be walked.
    #[error("cannot walk {}: {source}", dir.display())]
    Walk {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Return the files under `ref_dir` matching any of `patterns`.
///
/// Patterns are matched against paths relative to `ref_dir`; `*` stays within
/// one path segment and `**` spans any number of them. Results come in pattern
/// order, sorted by path within a pattern; a file matched by several patterns
/// is returned once. A missing `ref_dir` or no match yields an empty list.
pub fn find_references<S: AsRef<str>>(
    ref_dir: &Path,
    patterns: &[S],
) -> Result<Vec<FilePath>, ReferenceError> {
    let matchers = patterns
        .iter()
        .map(|p| {
            let pattern = p.as_ref();
            GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map(|g: Glob| g.compile_matcher())
                .map_err(|source| ReferenceError::Pattern {
                    pattern: pattern.to_string(),
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if matchers.is_empty() || !ref_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(ref_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|source| ReferenceError::Walk {
            dir: ref_dir.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(ref_dir)
            .unwrap_or(entry.path())
            .to_path_buf();
        files.push(FilePath {
            absolute: entry.path().to_path_buf(),
            relative,
        });
    }

    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for matcher in &matchers {
        for file in &files {
            if matcher.is_match(&file.relative) && seen.insert(&file.absolute) {
                found.push(file.clone());
            }
        }
    }
    Ok(found)
}
