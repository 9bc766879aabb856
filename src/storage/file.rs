//! Temporary files backing spilled LOB values.
//!
//! A [`TempFile`] is created with a pending delete obligation. It is
//! discharged exactly once, by an explicit close (which cancels the
//! obligation and calls [`TempFile::delete`]) or by `Drop` when the last
//! handle goes away.
//! Creation and deletion both run under the database's shared lob lock so
//! they never interleave with a backup enumerating temp files.

use crate::storage::error::{StorageError, StorageResult};
use log::{debug, warn};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// File name suffix of every temporary LOB file.
pub const SUFFIX_TEMP_FILE: &str = ".temp.db";

pub struct TempFile {
    path: PathBuf,
    auto_delete: AtomicBool,
    deleted: AtomicBool,
    lob_sync: Arc<Mutex<()>>,
}

impl TempFile {
    /// Create a new empty file named `<prefix><random suffix>.temp.db`.
    ///
    /// Returns the handle together with the open file for writing.
    pub fn create(prefix: &Path, lob_sync: Arc<Mutex<()>>) -> StorageResult<(Self, File)> {
        let (path, file) = {
            let _guard = lob_sync.lock();
            create_unique(prefix).map_err(|e| StorageError::conversion(e, prefix.display()))?
        };
        debug!("Created temp lob file {:?}", path);

        let temp = Self {
            path,
            auto_delete: AtomicBool::new(true),
            deleted: AtomicBool::new(false),
            lob_sync,
        };
        Ok((temp, file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete.load(Ordering::SeqCst)
    }

    /// Cancel the delete obligation.
    pub fn stop_auto_delete(&self) {
        self.auto_delete.store(false, Ordering::SeqCst);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Remove the file from disk; returns whether this call removed it.
    ///
    /// Once a call succeeds later calls do nothing. A failed removal leaves
    /// the file pending so the next call retries.
    pub fn delete(&self) -> StorageResult<bool> {
        let _guard = self.lob_sync.lock();
        if self.is_deleted() {
            return Ok(false);
        }

        let removed = match fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(StorageError::conversion(e, self.path.display())),
        };
        self.deleted.store(true, Ordering::SeqCst);
        if removed {
            debug!("Deleted temp lob file {:?}", self.path);
        }
        Ok(removed)
    }

    /// Open a reader positioned at the start of the file.
    pub fn reader(self: &Arc<Self>, close_between_reads: bool) -> TempFileReader {
        TempFileReader {
            owner: Arc::clone(self),
            position: 0,
            file: None,
            close_between_reads,
        }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.is_auto_delete() {
            if let Err(e) = self.delete() {
                warn!("Failed to delete temp lob file {:?}: {}", self.path, e);
            }
        }
    }
}

impl std::fmt::Debug for TempFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempFile")
            .field("path", &self.path)
            .field("auto_delete", &self.is_auto_delete())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

/// Sequential reader over a temp file.
///
/// Holds the [`TempFile`] alive for as long as it is read. With
/// `close_between_reads` the file is reopened and re-positioned on every
/// read so no descriptor stays open between calls.
pub struct TempFileReader {
    owner: Arc<TempFile>,
    position: u64,
    file: Option<File>,
    close_between_reads: bool,
}

impl Read for TempFileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.file.is_none() {
            let mut file = File::open(self.owner.path())?;
            file.seek(SeekFrom::Start(self.position))?;
            self.file = Some(file);
        }

        let n = match self.file.as_mut() {
            Some(file) => file.read(buf)?,
            None => 0,
        };
        self.position += n as u64;

        if self.close_between_reads {
            self.file = None;
        }
        Ok(n)
    }
}

/// List the temp files created under `prefix`.
pub fn list_temp_files(prefix: &Path) -> io::Result<Vec<PathBuf>> {
    let dir = match prefix.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let stem = prefix
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut files = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&stem) && name.ends_with(SUFFIX_TEMP_FILE) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn create_unique(prefix: &Path) -> io::Result<(PathBuf, File)> {
    loop {
        let mut name = prefix.as_os_str().to_os_string();
        name.push(format!("{:016x}", rand::random::<u64>()));
        name.push(SUFFIX_TEMP_FILE);
        let path = PathBuf::from(name);

        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
}
