//! zstd-compressed tar implementation of [`ArchiveCodec`].

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use tar::{Builder, EntryType, Header};
use tracing::{debug, info};

use super::{
    ArchiveCodec, PackedArchive, UnpackSummary, DEFAULT_COMPRESSION_LEVEL, FORMAT_VERSION,
    HEADER_LEN, MAGIC,
};
use crate::fs::walker::{walk_directory, EntryKind, WalkOptions};
use crate::utils::{BackupError, Result};

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

/// Packs trees as a tar stream inside a single zstd frame.
///
/// Headers are normalised (fixed modes, zero mtime and owner) and entries
/// are sorted, so the same tree always packs to the same bytes.
#[derive(Debug, Clone)]
pub struct ZstdTarCodec {
    level: i32,
    walk_options: WalkOptions,
}

impl Default for ZstdTarCodec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_LEVEL)
    }
}

impl ZstdTarCodec {
    pub fn new(level: i32) -> Self {
        Self {
            level,
            walk_options: WalkOptions::default(),
        }
    }

    /// Leave entries with these names out of every archive
    pub fn with_excludes(mut self, names: Vec<String>) -> Self {
        self.walk_options.exclude_names = names;
        self
    }

    pub fn level(&self) -> i32 {
        self.level
    }
}

impl ArchiveCodec for ZstdTarCodec {
    fn pack(&self, source: &Path) -> Result<PackedArchive> {
        match fs::metadata(source) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(BackupError::InvalidPath(format!(
                    "{} is not a directory",
                    source.display()
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackupError::SourceNotFound(source.to_path_buf()))
            }
            Err(e) => return Err(BackupError::io(source, e)),
        }

        let entries = walk_directory(source, &self.walk_options)?;

        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);

        let encoder = zstd::stream::write::Encoder::new(out, self.level)
            .map_err(|e| BackupError::io(source, e))?;
        let mut builder = Builder::new(encoder);

        let mut file_count = 0usize;
        let mut content_bytes = 0u64;

        for entry in &entries {
            match entry.kind {
                EntryKind::Dir => {
                    let mut header = normalised_header(EntryType::Directory, DIR_MODE, 0);
                    builder
                        .append_data(&mut header, &entry.relative_path, io::empty())
                        .map_err(|e| BackupError::io(&entry.path, e))?;
                }
                EntryKind::File { .. } => {
                    // Read the whole file up front so the header size always
                    // matches the bytes that follow it.
                    let data = fs::read(&entry.path).map_err(|e| BackupError::io(&entry.path, e))?;
                    let mut header =
                        normalised_header(EntryType::Regular, FILE_MODE, data.len() as u64);
                    builder
                        .append_data(&mut header, &entry.relative_path, data.as_slice())
                        .map_err(|e| BackupError::io(&entry.path, e))?;

                    file_count += 1;
                    content_bytes += data.len() as u64;
                    debug!(file = %entry.relative_path.display(), bytes = data.len(), "Added file to archive");
                }
            }
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| BackupError::io(source, e))?;
        let bytes = encoder.finish().map_err(|e| BackupError::io(source, e))?;

        info!(
            source = %source.display(),
            files = file_count,
            content_bytes,
            archive_bytes = bytes.len(),
            "Packed archive"
        );

        Ok(PackedArchive {
            bytes,
            file_count,
            content_bytes,
        })
    }

    fn unpack(&self, bytes: &[u8], destination: &Path) -> Result<UnpackSummary> {
        let payload = strip_container_header(bytes)?;

        fs::create_dir_all(destination).map_err(|e| BackupError::io(destination, e))?;
        let root = destination
            .canonicalize()
            .map_err(|e| BackupError::io(destination, e))?;

        let decoder = zstd::stream::read::Decoder::new(payload).map_err(corrupt)?;
        let mut archive = tar::Archive::new(decoder);
        let mut summary = UnpackSummary::default();

        for entry in archive.entries().map_err(corrupt)? {
            let mut entry = entry.map_err(corrupt)?;
            let raw_path = entry.path().map_err(corrupt)?.into_owned();
            let relative = sanitize_entry_path(&raw_path)?;
            let entry_type = entry.header().entry_type();

            if entry_type.is_dir() {
                create_dirs_within(&root, &relative)?;
                summary.dirs_created += 1;
            } else if entry_type.is_file() {
                let expected = entry.header().size().map_err(corrupt)?;
                // Grown by read_to_end; the header size is untrusted
                let mut data = Vec::new();
                entry.read_to_end(&mut data).map_err(corrupt)?;
                if data.len() as u64 != expected {
                    return Err(BackupError::CorruptArchive(format!(
                        "entry {} is truncated ({} of {} bytes)",
                        raw_path.display(),
                        data.len(),
                        expected
                    )));
                }

                let parent = match relative.parent() {
                    Some(parent) => create_dirs_within(&root, parent)?,
                    None => root.clone(),
                };
                let target = match relative.file_name() {
                    Some(name) => parent.join(name),
                    None => root.join(&relative),
                };
                write_regular_file(&target, &data)?;

                summary.files_written += 1;
                summary.bytes_written += data.len() as u64;
            } else {
                return Err(BackupError::InvalidArchiveEntry(format!(
                    "{} has unsupported entry type {:?}",
                    raw_path.display(),
                    entry_type
                )));
            }
        }

        info!(
            destination = %destination.display(),
            files = summary.files_written,
            bytes = summary.bytes_written,
            "Unpacked archive"
        );

        Ok(summary)
    }
}

fn normalised_header(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// Check magic and version, returning the compressed payload.
fn strip_container_header(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(BackupError::CorruptArchive("bad magic bytes".to_string()));
    }
    let version = bytes[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(BackupError::CorruptArchive(format!(
            "unsupported format version {}",
            version
        )));
    }
    Ok(&bytes[HEADER_LEN..])
}

/// Reduce an entry path to plain normal components. Anything that could
/// point outside the destination is rejected.
fn sanitize_entry_path(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(BackupError::InvalidArchiveEntry(format!(
                    "{} escapes the destination",
                    path.display()
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(BackupError::InvalidArchiveEntry(format!(
            "empty entry path {:?}",
            path
        )));
    }
    Ok(clean)
}

/// Create `relative` under `root` one component at a time, refusing to
/// pass through anything that is not a real directory. Symlinks already
/// present in the destination are never followed.
fn create_dirs_within(root: &Path, relative: &Path) -> Result<PathBuf> {
    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(BackupError::InvalidArchiveEntry(format!(
                    "{} is a symlink inside the destination",
                    current.display()
                )))
            }
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(BackupError::io(
                    &current,
                    io::Error::new(io::ErrorKind::AlreadyExists, "not a directory"),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => match fs::create_dir(&current) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && current.is_dir() => {}
                Err(e) => return Err(BackupError::io(&current, e)),
            },
            Err(e) => return Err(BackupError::io(&current, e)),
        }
    }
    Ok(current)
}

/// Write `data` to `target`, replacing a regular file but never writing
/// through a symlink.
fn write_regular_file(target: &Path, data: &[u8]) -> Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.file_type().is_symlink() => {
            return Err(BackupError::InvalidArchiveEntry(format!(
                "{} is a symlink inside the destination",
                target.display()
            )))
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(BackupError::io(target, e)),
    }

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(target)
        .map_err(|e| BackupError::io(target, e))?;
    file.write_all(data).map_err(|e| BackupError::io(target, e))
}

fn corrupt(err: io::Error) -> BackupError {
    BackupError::CorruptArchive(err.to_string())
}
