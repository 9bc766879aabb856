use crate::storage::error::StorageResult;
use crate::storage::file::list_temp_files;
use crate::storage::lob_store::{LobStore, MemoryLobStore};
use crate::value::LobKind;
use log::debug;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Prefix of temp files when the database has no path and none is configured.
pub const PREFIX_TEMP_FILE: &str = "vibelob";

/// Per-database context consulted by LOB values.
pub trait DataHandler: Send + Sync {
    /// Path of the database; empty for an in-memory database.
    fn database_path(&self) -> &Path;

    /// Path prefix for new temp files.
    fn temp_file_prefix(&self) -> PathBuf;

    /// Largest LOB (bytes or characters) kept inline in a row.
    fn max_length_inplace_lob(&self) -> usize;

    /// Compression algorithm applied to LOBs of `kind`, if any.
    fn lob_compression_algorithm(&self, kind: LobKind) -> Option<&str>;

    /// Whether temp-file readers reopen the file on every read.
    fn lob_close_between_reads(&self) -> bool;

    /// Lock serializing temp file creation, deletion and backup.
    fn lob_sync(&self) -> &Arc<Mutex<()>>;

    fn lob_store(&self) -> &dyn LobStore;
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Maximum size of a LOB stored inline.
    pub max_length_inplace_lob: usize,
    /// Compression algorithm name for LOB content, e.g. "lzf".
    pub lob_compression_algorithm: Option<String>,
    /// Temp file prefix used when the database has no path.
    pub temp_file_prefix: Option<PathBuf>,
    /// Close temp files between reads.
    pub lob_close_between_reads: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            max_length_inplace_lob: 256,
            lob_compression_algorithm: None,
            temp_file_prefix: None,
            lob_close_between_reads: false,
        }
    }
}

/// Database context owning the lob lock and the durable LOB store
pub struct Database {
    path: PathBuf,
    config: DatabaseConfig,
    lob_sync: Arc<Mutex<()>>,
    lob_store: Arc<dyn LobStore>,
}

impl Database {
    /// Open a database at the specified path, backed by an in-memory LOB store
    pub fn open(path: &Path, config: DatabaseConfig) -> StorageResult<Arc<Self>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self::with_lob_store(
            path,
            config,
            Arc::new(MemoryLobStore::new()),
        ))
    }

    /// Create a database without a path
    pub fn in_memory(config: DatabaseConfig) -> Arc<Self> {
        Self::with_lob_store(Path::new(""), config, Arc::new(MemoryLobStore::new()))
    }

    pub fn with_lob_store(
        path: &Path,
        config: DatabaseConfig,
        lob_store: Arc<dyn LobStore>,
    ) -> Arc<Self> {
        debug!(
            "Opening database {:?} (inline lob limit {})",
            path, config.max_length_inplace_lob
        );
        Arc::new(Self {
            path: path.to_path_buf(),
            config,
            lob_sync: Arc::new(Mutex::new(())),
            lob_store,
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// This database as the handler LOB values hold on to.
    pub fn handler(self: &Arc<Self>) -> Arc<dyn DataHandler> {
        self.clone()
    }

    /// List this database's temp files, e.g. for a backup.
    ///
    /// Runs under the lob lock so no temp file is created or deleted meanwhile.
    pub fn temp_files(&self) -> StorageResult<Vec<PathBuf>> {
        let _guard = self.lob_sync.lock();
        Ok(list_temp_files(&self.temp_file_prefix())?)
    }
}

impl DataHandler for Database {
    fn database_path(&self) -> &Path {
        &self.path
    }

    fn temp_file_prefix(&self) -> PathBuf {
        if !self.path.as_os_str().is_empty() {
            return self.path.clone();
        }
        match &self.config.temp_file_prefix {
            Some(prefix) => prefix.clone(),
            None => std::env::temp_dir().join(PREFIX_TEMP_FILE),
        }
    }

    fn max_length_inplace_lob(&self) -> usize {
        self.config.max_length_inplace_lob
    }

    fn lob_compression_algorithm(&self, _kind: LobKind) -> Option<&str> {
        self.config.lob_compression_algorithm.as_deref()
    }

    fn lob_close_between_reads(&self) -> bool {
        self.config.lob_close_between_reads
    }

    fn lob_sync(&self) -> &Arc<Mutex<()>> {
        &self.lob_sync
    }

    fn lob_store(&self) -> &dyn LobStore {
        self.lob_store.as_ref()
    }
}
