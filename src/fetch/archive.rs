//! FX-022: Archive sources (download, verify, unpack).
//!
//! Remote archives are downloaded with curl through the command runner;
//! `file://` and plain paths are read in place. A `sha256` on the
//! descriptor is checked before anything is unpacked. Extraction runs
//! in-process and checks the fetch deadline between entries. An archive
//! with a single top-level directory is unwrapped so the build starts
//! inside it.

use super::{check_deadline, exec_failure, local_path, ArchiveFormat};
use crate::core::error::StageError;
use crate::core::types::{PackageDescriptor, Stage};
use crate::exec::{CommandRequest, CommandRunner, Deadline};
use crate::tripwire::hasher;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
enum ExtractError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error("deadline expired")]
    Expired,
}

/// Download (or locate), verify, and unpack an archive into `dest`.
pub fn fetch_archive(
    runner: &dyn CommandRunner,
    descriptor: &PackageDescriptor,
    format: ArchiveFormat,
    dest: &Path,
    deadline: &Deadline,
) -> Result<(), StageError> {
    let url = descriptor.source_url.trim();
    let work = dest.parent().unwrap_or(dest);

    let archive = if is_remote(url) {
        let target = work.join("download");
        download(runner, url, &target, deadline)?;
        target
    } else {
        let path = PathBuf::from(local_path(url));
        if !path.is_file() {
            return Err(StageError::fetch(
                url,
                format!("{} does not exist", path.display()),
            ));
        }
        path
    };

    if let Some(expected) = descriptor.sha256.as_deref() {
        verify_sha256(url, &archive, expected)?;
    }
    check_deadline(deadline)?;

    let unpack = work.join("unpack");
    std::fs::create_dir_all(&unpack)
        .map_err(|e| StageError::fetch(url, format!("{}: {}", unpack.display(), e)))?;

    extract(format, &archive, &unpack, deadline).map_err(|e| match e {
        ExtractError::Expired => StageError::Timeout {
            stage: Stage::Fetching,
            limit: deadline.limit().unwrap_or_default(),
        },
        other => StageError::fetch(url, format!("cannot unpack archive: {}", other)),
    })?;

    promote(&unpack, dest).map_err(|e| StageError::fetch(url, e.to_string()))
}

fn is_remote(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("ftp://")
}

fn download(
    runner: &dyn CommandRunner,
    url: &str,
    target: &Path,
    deadline: &Deadline,
) -> Result<(), StageError> {
    let target_str = target.display().to_string();
    let script = shell_words::join(["curl", "-fsSL", "--output", target_str.as_str(), "--", url]);
    let output = runner
        .run(&CommandRequest::new(&script).timeout(deadline.remaining()))
        .map_err(|e| exec_failure(url, deadline, e))?;

    if !output.success() {
        return Err(StageError::fetch(
            url,
            format!(
                "download exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            ),
        ));
    }
    if !target.is_file() {
        return Err(StageError::fetch(url, "download produced no file"));
    }
    Ok(())
}

fn verify_sha256(url: &str, archive: &Path, expected: &str) -> Result<(), StageError> {
    let actual = hasher::sha256_file(archive)
        .map_err(|e| StageError::fetch(url, format!("cannot hash archive: {}", e)))?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(StageError::fetch(
            url,
            format!("checksum mismatch: expected {}, got {}", expected.trim(), actual),
        ));
    }
    Ok(())
}

fn extract(
    format: ArchiveFormat,
    archive: &Path,
    into: &Path,
    deadline: &Deadline,
) -> Result<(), ExtractError> {
    let file = BufReader::new(File::open(archive)?);
    match format {
        ArchiveFormat::Tar => unpack_tar(file, into, deadline),
        ArchiveFormat::TarGz => unpack_tar(flate2::read::GzDecoder::new(file), into, deadline),
        ArchiveFormat::TarBz2 => unpack_tar(bzip2::read::BzDecoder::new(file), into, deadline),
        ArchiveFormat::TarZst => {
            unpack_tar(zstd::stream::read::Decoder::new(file)?, into, deadline)
        }
        ArchiveFormat::Zip => unpack_zip(archive, into, deadline),
    }
}

fn unpack_tar<R: Read>(reader: R, into: &Path, deadline: &Deadline) -> Result<(), ExtractError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    for entry in archive.entries()? {
        if deadline.expired() {
            return Err(ExtractError::Expired);
        }
        // unpack_in refuses entries that escape `into`
        entry?.unpack_in(into)?;
    }
    Ok(())
}

fn unpack_zip(archive: &Path, into: &Path, deadline: &Deadline) -> Result<(), ExtractError> {
    let mut zip = zip::ZipArchive::new(BufReader::new(File::open(archive)?))?;
    for i in 0..zip.len() {
        if deadline.expired() {
            return Err(ExtractError::Expired);
        }
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let out = into.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&out)?;
        std::io::copy(&mut entry, &mut file)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode & 0o777))?;
            }
        }
    }
    Ok(())
}

/// Move the unpacked tree to `dest`, unwrapping a lone top-level directory.
fn promote(unpack: &Path, dest: &Path) -> std::io::Result<()> {
    let entries: Vec<_> = std::fs::read_dir(unpack)?.collect::<Result<_, _>>()?;
    if let [only] = entries.as_slice() {
        if only.file_type()?.is_dir() {
            std::fs::rename(only.path(), dest)?;
            return std::fs::remove_dir(unpack);
        }
    }
    std::fs::rename(unpack, dest)
}
