//! Test case discovery.
//!
//! A test case is a directory containing a `test-settings.yaml` file.

use crate::SETTINGS_FILENAME;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directories never searched for test cases.
const SKIPPED_DIRS: &[&str] = &["__pycache__", "target", "node_modules"];

/// Find all test case directories under `path`.
///
/// `path` may also be a case directory or a settings file. Cases are returned
/// in execution order, see [`case_order`].
pub fn find_cases(path: &Path) -> Result<Vec<PathBuf>, walkdir::Error> {
    if path.is_file() {
        let is_settings = path.file_name().is_some_and(|f| f == SETTINGS_FILENAME);
        return Ok(match path.parent() {
            Some(parent) if is_settings => vec![parent.to_path_buf()],
            _ => Vec::new(),
        });
    }

    let mut cases = Vec::new();
    let walker = WalkDir::new(path).into_iter().filter_entry(|e| {
        if e.depth() == 0 || !e.file_type().is_dir() {
            return true;
        }
        let name = e.file_name().to_string_lossy();
        !name.starts_with('.') && !SKIPPED_DIRS.contains(&&*name)
    });
    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry.file_name() == SETTINGS_FILENAME
            && let Some(parent) = entry.path().parent()
        {
            cases.push(parent.to_path_buf());
        }
    }
    cases.sort_by(|a, b| case_order(a, b));
    Ok(cases)
}

/// Execution order of two case directories.
///
/// Paths are compared segment by segment, except that a directory comes after
/// all the directories below it: the cases of a parent directory run once
/// those of its children are done.
pub fn case_order(a: &Path, b: &Path) -> Ordering {
    let mut a_parts = a.components();
    let mut b_parts = b.components();
    loop {
        match (a_parts.next(), b_parts.next()) {
            (Some(x), Some(y)) => match x.cmp(&y) {
                Ordering::Equal => continue,
                other => return other,
            },
            (Some(_), None) => return Ordering::Less,
            (None, Some(_)) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
        }
    }
}

/// Group paths so that paths nested in one another share a group.
///
/// Returns the indices of `paths` per group; groups and the indices within a
/// group keep the order of `paths`. Distinct groups never overlap on disk.
pub fn group_nested(paths: &[PathBuf]) -> Vec<Vec<usize>> {
    let mut groups: Vec<(PathBuf, Vec<usize>)> = Vec::new();
    for (index, path) in paths.iter().enumerate() {
        let root = paths
            .iter()
            .filter(|other| path.starts_with(other))
            .min_by_key(|other| other.components().count())
            .unwrap_or(path);
        match groups.iter_mut().find(|(r, _)| r == root) {
            Some((_, members)) => members.push(index),
            None => groups.push((root.clone(), vec![index])),
        }
    }
    groups.into_iter().map(|(_, members)| members).collect()
}

/// State of one collection pass.
///
/// Holds the marks declared by each case directory so they can be applied to
/// every case below it. Create one per pass and drop it at the end.
#[derive(Debug, Default)]
pub struct CollectionContext {
    marks: BTreeMap<PathBuf, BTreeSet<String>>,
}

impl CollectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the marks declared by the case at `dir`.
    pub fn record(&mut self, dir: &Path, marks: &BTreeSet<String>) {
        if !marks.is_empty() {
            self.marks
                .entry(dir.to_path_buf())
                .or_default()
                .extend(marks.iter().cloned());
        }
    }

    /// Marks applying to `dir`: its own and those of the case directories above it.
    pub fn marks_for(&self, dir: &Path) -> BTreeSet<String> {
        self.marks
            .iter()
            .filter(|(case_dir, _)| dir.starts_with(case_dir))
            .flat_map(|(_, marks)| marks.iter().cloned())
            .collect()
    }
}

/// Case selection from the command line.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Substring the case name shall contain.
    pub filter: Option<String>,
    /// Marks the case shall all have.
    pub marks: Vec<String>,
}

impl Selection {
    pub fn matches(&self, name: &str, marks: &BTreeSet<String>) -> bool {
        self.filter.as_deref().is_none_or(|f| name.contains(f))
            && self.marks.iter().all(|m| marks.contains(m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn make_case(root: &Path, rel: &str) -> PathBuf {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(SETTINGS_FILENAME), "").unwrap();
        dir
    }

    #[test]
    fn finds_cases_children_first() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        make_case(root, "a");
        make_case(root, "a/b");
        make_case(root, "a/b/c");
        make_case(root, "b");
        fs::create_dir_all(root.join("empty")).unwrap();
        make_case(root, ".hidden/case");
        make_case(root, "__pycache__/case");

        let cases = find_cases(root).unwrap();
        assert_eq!(
            cases,
            vec![
                root.join("a/b/c"),
                root.join("a/b"),
                root.join("a"),
                root.join("b"),
            ]
        );
    }

    #[test]
    fn settings_file_is_a_case() {
        let tmp = tempdir().unwrap();
        let dir = make_case(tmp.path(), "case");

        assert_eq!(find_cases(&dir.join(SETTINGS_FILENAME)).unwrap(), vec![dir.clone()]);
        assert_eq!(find_cases(&dir).unwrap(), vec![dir.clone()]);

        fs::write(dir.join("other.txt"), "").unwrap();
        assert!(find_cases(&dir.join("other.txt")).unwrap().is_empty());
    }

    #[test]
    fn order_is_total() {
        let mut paths = vec![
            PathBuf::from("x"),
            PathBuf::from("a"),
            PathBuf::from("a/z"),
            PathBuf::from("a/b"),
            PathBuf::from("a/b/c"),
        ];
        paths.sort_by(|a, b| case_order(a, b));
        assert_eq!(
            paths,
            vec![
                PathBuf::from("a/b/c"),
                PathBuf::from("a/b"),
                PathBuf::from("a/z"),
                PathBuf::from("a"),
                PathBuf::from("x"),
            ]
        );
    }

    #[test]
    fn groups_nested_paths() {
        let paths = vec![
            PathBuf::from("/out/a/b"),
            PathBuf::from("/out/a"),
            PathBuf::from("/out/c"),
            PathBuf::from("/out/ab"),
        ];
        assert_eq!(group_nested(&paths), vec![vec![0, 1], vec![2], vec![3]]);
    }

    #[test]
    fn marks_propagate_to_children() {
        let mut ctx = CollectionContext::new();
        ctx.record(Path::new("/in/a"), &BTreeSet::from(["slow".to_string()]));
        ctx.record(Path::new("/in/a/b"), &BTreeSet::from(["big".to_string()]));
        ctx.record(Path::new("/in/c"), &BTreeSet::new());

        assert_eq!(
            ctx.marks_for(Path::new("/in/a/b")),
            BTreeSet::from(["big".to_string(), "slow".to_string()])
        );
        assert_eq!(
            ctx.marks_for(Path::new("/in/a")),
            BTreeSet::from(["slow".to_string()])
        );
        assert!(ctx.marks_for(Path::new("/in/ab")).is_empty());
        assert!(ctx.marks_for(Path::new("/in/c")).is_empty());
    }

    #[test]
    fn selection() {
        let marks = BTreeSet::from(["slow".to_string()]);
        assert!(Selection::default().matches("any", &BTreeSet::new()));

        let by_name = Selection {
            filter: Some("mesh".to_string()),
            marks: vec![],
        };
        assert!(by_name.matches("cases/mesh-1", &marks));
        assert!(!by_name.matches("cases/flow", &marks));

        let by_mark = Selection {
            filter: None,
            marks: vec!["slow".to_string()],
        };
        assert!(by_mark.matches("x", &marks));
        assert!(!by_mark.matches("x", &BTreeSet::new()));
    }
}
