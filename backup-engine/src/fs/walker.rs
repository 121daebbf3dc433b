//! Directory traversal for archive creation.
//!
//! Symbolic links are never followed and never reported: a link inside the
//! tree is skipped (logged at debug level) whether it points at a file, a
//! directory, or nothing. Sockets, FIFOs and device nodes are skipped the
//! same way. Entries come back sorted by file name so that packing the same
//! tree twice produces the same archive.

use std::io;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::utils::{BackupError, Result};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// File or directory names to leave out (exact name match, excluded
    /// directories are not descended into)
    pub exclude_names: Vec<String>,
}

/// What a walked entry is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File { size: u64 },
    Dir,
}

/// An entry discovered during walking
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Full path on disk
    pub path: PathBuf,

    /// Path relative to the walk root
    pub relative_path: PathBuf,

    pub kind: EntryKind,
}

impl WalkEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    fn from_entry(entry: &DirEntry, root: &Path) -> Result<Option<Self>> {
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            tracing::debug!(path = %entry.path().display(), "Skipping symbolic link");
            return Ok(None);
        }

        let kind = if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            let metadata = entry
                .metadata()
                .map_err(|e| walk_error(entry.path(), e))?;
            EntryKind::File {
                size: metadata.len(),
            }
        } else {
            tracing::debug!(path = %entry.path().display(), "Skipping special file");
            return Ok(None);
        };

        let path = entry.path().to_path_buf();
        let relative_path = path
            .strip_prefix(root)
            .map_err(|_| {
                BackupError::InvalidPath(format!(
                    "{} is not inside {}",
                    path.display(),
                    root.display()
                ))
            })?
            .to_path_buf();

        Ok(Some(Self {
            path,
            relative_path,
            kind,
        }))
    }
}

/// Walk a directory tree and collect every file and directory below `root`.
///
/// The root itself is not included. Any unreadable directory or entry fails
/// the whole walk with [`BackupError::IoAccess`].
pub fn walk_directory(root: &Path, options: &WalkOptions) -> Result<Vec<WalkEntry>> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !should_exclude(entry, &options.exclude_names));

    for entry in walker {
        let entry = entry.map_err(|e| walk_error(root, e))?;

        if let Some(walk_entry) = WalkEntry::from_entry(&entry, root)? {
            entries.push(walk_entry);
        }
    }

    Ok(entries)
}

fn should_exclude(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|name| *name == file_name)
}

fn walk_error(fallback: &Path, err: walkdir::Error) -> BackupError {
    let path = err.path().unwrap_or(fallback).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop detected"));
    BackupError::io(path, source)
}
