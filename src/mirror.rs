//! Output tree mirroring.
//!
//! A case directory under the inputs tree is mapped to a directory under an
//! output root, then shallow copied there: directories are created, files
//! become symbolic links to the originals.

use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Entries never linked into an output tree.
pub const OUTPUT_IGNORED_FILES: &[&str] = &[".cache", "__pycache__", crate::SETTINGS_FILENAME];

/// Error type for mirroring operations.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// The source directory is not under the working directory.
    #[error(
        "the current working directory {} shall be a parent directory of the inputs directory {}",
        cwd.display(),
        source_dir.display()
    )]
    OutsideWorkingDir { cwd: PathBuf, source_dir: PathBuf },
    /// The destination exists and the policy forbids reusing it.
    #[error("the output directory {} already exists", .0.display())]
    AlreadyExists(PathBuf),
    /// Filesystem failure.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MirrorError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| MirrorError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What to do when the destination of [`materialize`] already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverwritePolicy {
    /// Fail if the destination exists.
    pub must_not_exist: bool,
    /// Remove an existing destination before rebuilding it.
    pub clean_if_exists: bool,
}

/// Return the mirror of `source` under `dest_root`, relative to the process
/// working directory.
///
/// See [`mirror_path_from`].
pub fn compute_mirror_path(source: &Path, dest_root: &Path) -> Result<PathBuf, MirrorError> {
    let cwd = std::env::current_dir().map_err(MirrorError::io(Path::new(".")))?;
    mirror_path_from(&cwd, source, dest_root)
}

/// Return the mirror of `source` under `dest_root`, relative to `base`.
///
/// `source` shall be an existing directory under `base`. The mirrored part is
/// the path of `source` relative to `base` without the segments it shares with
/// `dest_root` and without one more leading segment. Given a base, `c/d/e`
/// mirrored to `x/y` is `x/y/d/e`, and `a/b/c/d/e` mirrored to `a/b/x/y` is
/// `a/b/x/y/d/e`.
pub fn mirror_path_from(base: &Path, source: &Path, dest_root: &Path) -> Result<PathBuf, MirrorError> {
    let base = base.canonicalize().map_err(MirrorError::io(base))?;
    let source = source.canonicalize().map_err(MirrorError::io(source))?;

    let relative_source = source
        .strip_prefix(&base)
        .map_err(|_| MirrorError::OutsideWorkingDir {
            cwd: base.clone(),
            source_dir: source.clone(),
        })?;

    // the first segment is always dropped
    let mut offset = 1;
    if let Ok(relative_dest) = dest_root.strip_prefix(&base) {
        offset += relative_source
            .components()
            .zip(relative_dest.components())
            .take_while(|(s, d)| s == d)
            .count();
    }

    let mut mirrored = dest_root.to_path_buf();
    mirrored.extend(
        relative_source
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .skip(offset),
    );
    Ok(mirrored)
}

/// Shallow copy the `source` tree to `dest`.
///
/// Entries named in `ignored` are skipped at every level.
pub fn materialize(
    source: &Path,
    dest: &Path,
    policy: OverwritePolicy,
    ignored: &[&str],
) -> Result<(), MirrorError> {
    if dest.is_dir() {
        if policy.clean_if_exists {
            debug!("removing output directory {}", dest.display());
            std::fs::remove_dir_all(dest).map_err(MirrorError::io(dest))?;
        } else if policy.must_not_exist {
            return Err(MirrorError::AlreadyExists(dest.to_path_buf()));
        }
    }

    debug!(
        "creating a shallow copy from {} to {}",
        source.display(),
        dest.display()
    );
    shallow_copy(source, dest, ignored)
}

fn shallow_copy(source: &Path, dest: &Path, ignored: &[&str]) -> Result<(), MirrorError> {
    std::fs::create_dir_all(dest).map_err(MirrorError::io(dest))?;

    let mut entries = std::fs::read_dir(source)
        .map_err(MirrorError::io(source))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(MirrorError::io(source))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if name.to_str().is_some_and(|n| ignored.contains(&n)) {
            continue;
        }
        let src_entry = entry.path();
        let dst_entry = dest.join(&name);

        if src_entry.is_dir() {
            // real directories, so a child file cannot be modified through the link
            shallow_copy(&src_entry, &dst_entry, ignored)?;
        } else {
            if dst_entry.symlink_metadata().is_ok() {
                std::fs::remove_file(&dst_entry).map_err(MirrorError::io(&dst_entry))?;
            }
            symlink(&src_entry, &dst_entry).map_err(MirrorError::io(&dst_entry))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn symlink(original: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(original, link)
}
