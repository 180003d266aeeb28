//! FX-023: Local directory sources (`file://` or a plain path).

use super::{check_deadline, local_path};
use crate::core::error::StageError;
use crate::core::types::PackageDescriptor;
use crate::exec::Deadline;
use std::path::Path;

/// Copy a local source directory into `dest`.
pub fn copy_source(
    descriptor: &PackageDescriptor,
    dest: &Path,
    deadline: &Deadline,
) -> Result<(), StageError> {
    let url = &descriptor.source_url;
    let src = Path::new(local_path(url));
    if !src.is_dir() {
        return Err(StageError::fetch(
            url,
            format!("{} is not a directory", src.display()),
        ));
    }
    copy_tree(src, dest, deadline, url)
}

/// Recursive copy; symlinks are recreated, not followed.
pub(crate) fn copy_tree(
    src: &Path,
    dest: &Path,
    deadline: &Deadline,
    url: &str,
) -> Result<(), StageError> {
    let io_err = |path: &Path, e: std::io::Error| {
        StageError::fetch(url, format!("{}: {}", path.display(), e))
    };

    std::fs::create_dir_all(dest).map_err(|e| io_err(dest, e))?;

    let mut entries: Vec<_> = std::fs::read_dir(src)
        .map_err(|e| io_err(src, e))?
        .collect::<Result<_, _>>()
        .map_err(|e| io_err(src, e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        check_deadline(deadline)?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| io_err(&from, e))?;

        if file_type.is_symlink() {
            copy_symlink(&from, &to).map_err(|e| io_err(&from, e))?;
        } else if file_type.is_dir() {
            copy_tree(&from, &to, deadline, url)?;
        } else {
            std::fs::copy(&from, &to).map_err(|e| io_err(&from, e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    let target = std::fs::read_link(from)?;
    std::os::unix::fs::symlink(target, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::copy(from, to).map(|_| ())
}
