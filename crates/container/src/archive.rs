//! Tar helpers for moving files in and out of containers.
//!
//! The Docker archive API speaks uncompressed tar in both directions. These
//! functions are synchronous; async callers run them on the blocking pool.

use std::fs;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;

use testbed_core::types::FileCopy;

use crate::error::ContainerError;

/// Directory names never copied into the test runner.
pub const WORKSPACE_SKIP: [&str; 3] = [".git", "node_modules", "target"];

fn archive_err(path: &Path, err: impl std::fmt::Display) -> ContainerError {
    ContainerError::Archive {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Packs individual host files into an archive meant to be extracted at `/`.
///
/// Each entry is stored under its absolute container target with the
/// leading `/` stripped.
pub fn pack_files(files: &[FileCopy]) -> Result<Vec<u8>, ContainerError> {
    let mut builder = tar::Builder::new(Vec::new());

    for file in files {
        let target = file.target.trim_start_matches('/');
        if target.is_empty() {
            return Err(ContainerError::Config {
                field: "files.target".to_owned(),
                reason: format!("invalid target for {}", file.source.display()),
            });
        }
        builder
            .append_path_with_name(&file.source, target)
            .map_err(|e| archive_err(&file.source, e))?;
    }

    builder
        .into_inner()
        .map_err(|e| archive_err(Path::new("/"), e))
}

/// Packs the contents of `root` (not `root` itself), skipping any directory
/// whose name is in `skip`. Entries are stored in file-name order.
pub fn pack_dir(root: &Path, skip: &[&str]) -> Result<Vec<u8>, ContainerError> {
    if !root.is_dir() {
        return Err(archive_err(root, "not a directory"));
    }

    let skip: Vec<String> = skip.iter().map(|s| (*s).to_owned()).collect();
    // The workspace is copied as-is: no ignore files, hidden entries included.
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .ignore(false)
        .parents(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(move |entry| {
            let skipped_dir = entry.depth() > 0
                && entry.file_type().is_some_and(|t| t.is_dir())
                && skip.iter().any(|s| entry.file_name() == s.as_str());
            !skipped_dir
        })
        .build();

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    for entry in walker {
        let entry = entry.map_err(|e| archive_err(root, e))?;
        if entry.depth() == 0 {
            continue;
        }
        let path = entry.path();
        let rel = path.strip_prefix(root).map_err(|e| archive_err(path, e))?;

        let appended = match entry.file_type() {
            Some(t) if t.is_dir() => builder.append_dir(rel, path),
            _ => builder.append_path_with_name(path, rel),
        };
        appended.map_err(|e| archive_err(path, e))?;
    }

    builder.into_inner().map_err(|e| archive_err(root, e))
}

/// Unpacks `archive` into `dest` (created if missing).
///
/// Entries that would escape `dest` are skipped. Returns the unpacked file
/// paths relative to `dest`.
pub fn unpack(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, ContainerError> {
    fs::create_dir_all(dest).map_err(|e| archive_err(dest, e))?;

    let file = fs::File::open(archive).map_err(|e| archive_err(archive, e))?;
    let mut tar = tar::Archive::new(file);
    let mut unpacked = Vec::new();

    for entry in tar.entries().map_err(|e| archive_err(archive, e))? {
        let mut entry = entry.map_err(|e| archive_err(archive, e))?;
        let path = entry
            .path()
            .map_err(|e| archive_err(archive, e))?
            .into_owned();
        let is_file = entry.header().entry_type().is_file();
        let written = entry
            .unpack_in(dest)
            .map_err(|e| archive_err(&dest.join(&path), e))?;
        if written && is_file {
            unpacked.push(path);
        }
    }
    Ok(unpacked)
}
