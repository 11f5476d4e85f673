//! Moving the build workspace between the local host and the build VM.
//!
//! The local side zips the workspace in memory and writes it to the build
//! bucket, from where the session copies it onto the host over WinRM. Results
//! travel back the same way under a second key that shares the build's
//! timestamped prefix.

use std::io::{Cursor, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::storage::{ObjectRef, ObjectStore, StorageError};

/// Final key segment of the uploaded workspace.
pub const INPUT_ARCHIVE_NAME: &str = "workspace.zip";
/// Final key segment of the build results.
pub const RESULTS_ARCHIVE_NAME: &str = "results.zip";

/// Errors raised while archiving, extracting, or moving a workspace.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A directory or file could not be read.
    #[error("failed to read {path}: {message}")]
    Read {
        /// Path relative to the workspace root.
        path: Utf8PathBuf,
        /// Underlying error.
        message: String,
    },
    /// A file could not be written during extraction.
    #[error("failed to write {path}: {message}")]
    Write {
        /// Path relative to the workspace root.
        path: Utf8PathBuf,
        /// Underlying error.
        message: String,
    },
    /// The zip stream could not be produced or parsed.
    #[error("invalid archive: {0}")]
    Archive(String),
    /// An entry would escape the extraction root.
    #[error("archive entry {0} escapes the workspace")]
    UnsafeEntry(String),
    /// Moving the archive through object storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<zip::result::ZipError> for TransferError {
    fn from(value: zip::result::ZipError) -> Self {
        Self::Archive(value.to_string())
    }
}

/// Storage keys for one build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArchiveLocation {
    /// Uploaded workspace.
    pub input: ObjectRef,
    /// Results published by the remote host.
    pub results: ObjectRef,
}

impl ArchiveLocation {
    /// Builds the locations for a build in `project` started at `timestamp`.
    ///
    /// The bucket is `{prefix}{project}` and both keys live under
    /// `{prefix}{timestamp}/`.
    #[must_use]
    pub fn for_build(prefix: &str, project: &str, timestamp: DateTime<Utc>) -> Self {
        let bucket = format!("{prefix}{project}");
        let folder = format!(
            "{prefix}{}",
            timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        Self {
            input: ObjectRef::new(bucket.clone(), format!("{folder}/{INPUT_ARCHIVE_NAME}")),
            results: ObjectRef::new(bucket, format!("{folder}/{RESULTS_ARCHIVE_NAME}")),
        }
    }
}

/// Zipped workspace ready for upload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkspaceArchive {
    /// Zip bytes.
    pub bytes: Vec<u8>,
    /// Number of file entries.
    pub entries: usize,
    /// Destination object.
    pub object: ObjectRef,
}

/// Zips every regular file under `root`.
///
/// Entry names are `/`-separated paths relative to `root`, in sorted order.
/// Symlinks are skipped; any other read failure aborts the archive.
///
/// # Errors
///
/// Returns [`TransferError::Read`] when the tree cannot be walked or read,
/// or [`TransferError::Archive`] when the zip cannot be written.
pub fn archive_dir(root: &Dir) -> Result<(Vec<u8>, usize), TransferError> {
    let mut files = Vec::new();
    collect_files(root, Utf8Path::new(""), &mut files)?;
    files.sort_unstable();

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for relative in &files {
        let contents = root.read(relative).map_err(|err| read_error(relative, &err))?;
        writer.start_file(relative.as_str(), options)?;
        writer
            .write_all(&contents)
            .map_err(|err| TransferError::Archive(err.to_string()))?;
    }
    let bytes = writer.finish()?.into_inner();
    Ok((bytes, files.len()))
}

fn collect_files(
    root: &Dir,
    relative: &Utf8Path,
    files: &mut Vec<Utf8PathBuf>,
) -> Result<(), TransferError> {
    let dir = if relative.as_str().is_empty() {
        root.try_clone().map_err(|err| read_error(relative, &err))?
    } else {
        root.open_dir(relative).map_err(|err| read_error(relative, &err))?
    };

    for item in dir.entries().map_err(|err| read_error(relative, &err))? {
        let entry = item.map_err(|err| read_error(relative, &err))?;
        let name = entry.file_name().map_err(|err| read_error(relative, &err))?;
        let path = relative.join(&name);
        let file_type = entry.file_type().map_err(|err| read_error(&path, &err))?;
        if file_type.is_symlink() {
            tracing::debug!(path = %path, "skipping symlink");
        } else if file_type.is_dir() {
            collect_files(root, &path, files)?;
        } else if file_type.is_file() {
            files.push(path);
        }
    }
    Ok(())
}

fn read_error(path: &Utf8Path, err: &std::io::Error) -> TransferError {
    TransferError::Read {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Unpacks `bytes` under `root`, overwriting existing files.
///
/// Backslash separators are normalised; absolute entries and `..` components
/// are rejected before anything is written for that entry.
///
/// # Errors
///
/// Returns [`TransferError::UnsafeEntry`] for an escaping entry,
/// [`TransferError::Archive`] for a corrupt zip, or
/// [`TransferError::Write`] when a file cannot be written.
pub fn extract_archive(bytes: &[u8], root: &Dir) -> Result<usize, TransferError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut written = 0;
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        let raw_name = file.name().replace('\\', "/");
        let Some(relative) = safe_relative_path(&raw_name) else {
            return Err(TransferError::UnsafeEntry(raw_name));
        };
        if relative.as_str().is_empty() {
            continue;
        }

        if file.is_dir() || raw_name.ends_with('/') {
            root.create_dir_all(&relative)
                .map_err(|err| write_error(&relative, &err))?;
            continue;
        }
        if let Some(parent) = relative.parent().filter(|parent| !parent.as_str().is_empty()) {
            root.create_dir_all(parent)
                .map_err(|err| write_error(parent, &err))?;
        }
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|err| TransferError::Archive(err.to_string()))?;
        root.write(&relative, contents)
            .map_err(|err| write_error(&relative, &err))?;
        written += 1;
    }
    Ok(written)
}

fn write_error(path: &Utf8Path, err: &std::io::Error) -> TransferError {
    TransferError::Write {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Returns the normalised relative path of an entry, or `None` when it is
/// absolute or climbs out of the root.
fn safe_relative_path(name: &str) -> Option<Utf8PathBuf> {
    if name.starts_with('/') {
        return None;
    }
    let mut path = Utf8PathBuf::new();
    for component in name.split('/') {
        match component {
            "" | "." => {}
            ".." => return None,
            part if part.contains(':') => return None,
            part => path.push(part),
        }
    }
    Some(path)
}

fn open_root(path: &Utf8Path) -> Result<Dir, TransferError> {
    Dir::open_ambient_dir(path, ambient_authority()).map_err(|err| read_error(path, &err))
}

/// Uploads and downloads workspace archives for one build.
#[derive(Debug)]
pub struct WorkspaceTransfer<S> {
    store: S,
    location: ArchiveLocation,
}

impl<S: ObjectStore> WorkspaceTransfer<S> {
    /// Creates a transfer for `location` through `store`.
    #[must_use]
    pub const fn new(store: S, location: ArchiveLocation) -> Self {
        Self { store, location }
    }

    /// Storage keys used by this build.
    #[must_use]
    pub const fn location(&self) -> &ArchiveLocation {
        &self.location
    }

    /// Zips the workspace at `root` and writes it to the input key.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] when archiving or the upload fails.
    pub async fn upload(&self, root: &Utf8Path) -> Result<WorkspaceArchive, TransferError> {
        let dir = open_root(root)?;
        let (bytes, entries) = archive_dir(&dir)?;
        let object = self.location.input.clone();
        tracing::info!(
            workspace = %root,
            entries,
            size = bytes.len(),
            object = %object.uri(),
            "uploading workspace"
        );
        self.store
            .write_object(&object.bucket, &object.key, bytes.clone())
            .await?;
        Ok(WorkspaceArchive {
            bytes,
            entries,
            object,
        })
    }

    /// Reads the results archive and unpacks it over the workspace at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] when the download or extraction fails.
    pub async fn download(&self, root: &Utf8Path) -> Result<usize, TransferError> {
        let object = &self.location.results;
        let bytes = self.store.read_object(&object.bucket, &object.key).await?;
        Dir::create_ambient_dir_all(root, ambient_authority())
            .map_err(|err| write_error(root, &err))?;
        let dir = open_root(root)?;
        let written = extract_archive(&bytes, &dir)?;
        tracing::info!(workspace = %root, files = written, object = %object.uri(), "extracted build results");
        Ok(written)
    }
}

#[cfg(test)]
mod tests;
