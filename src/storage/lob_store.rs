//! Durable LOB store interface and an in-memory implementation.

use crate::storage::error::{StorageError, StorageResult};
use crate::value::text::read_chars;
use crate::value::LobKind;
use bytes::Bytes;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use log::{debug, trace};
use sha2::Sha256;
use std::io::{self, BufReader, Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Table id of LOBs owned by a session variable rather than a table row.
pub const TABLE_ID_SESSION_VARIABLE: i32 = -1;

/// Table id of LOBs freshly created in the store and not yet linked.
pub const TABLE_TEMP: i32 = -2;

/// Table id of LOBs bound to a result set.
pub const TABLE_RESULT: i32 = -3;

/// Metadata identifying a LOB held by a durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobRef {
    pub lob_id: i64,
    pub hmac: Vec<u8>,
    pub table_id: i32,
    /// Length in characters (CLOB) or bytes (BLOB).
    pub precision: u64,
}

/// Durable object store consulted by LOB values.
pub trait LobStore: Send + Sync {
    /// Store the content of `source` as a new LOB under [`TABLE_TEMP`].
    ///
    /// CLOB sources are UTF-8 encoded and `max_length` counts characters.
    fn create_lob(
        &self,
        kind: LobKind,
        source: &mut dyn Read,
        max_length: Option<u64>,
    ) -> StorageResult<LobRef>;

    /// Open the content of a LOB after verifying its HMAC. A non-negative
    /// `byte_count` must match the stored length.
    fn input_stream(
        &self,
        lob_id: i64,
        hmac: &[u8],
        byte_count: i64,
    ) -> StorageResult<Box<dyn Read + Send>>;

    /// Copy a LOB's content into a new LOB owned by `table_id`.
    fn copy_lob(&self, lob_id: i64, table_id: i32, precision: u64) -> StorageResult<LobRef>;

    /// Reassign a LOB to another table id.
    fn set_table(&self, lob_id: i64, table_id: i32) -> StorageResult<()>;

    /// Release a LOB. Removing an unknown LOB is not an error.
    fn remove_lob(&self, lob_id: i64) -> StorageResult<()>;

    fn is_read_only(&self) -> bool;
}

struct StoredLob {
    data: Bytes,
    table_id: i32,
    precision: u64,
}

/// LOB store keeping content in memory, authenticated with HMAC-SHA256.
pub struct MemoryLobStore {
    lobs: DashMap<i64, StoredLob>,
    next_lob_id: AtomicI64,
    hmac_key: [u8; 32],
    read_only: AtomicBool,
}

impl MemoryLobStore {
    pub fn new() -> Self {
        Self {
            lobs: DashMap::new(),
            next_lob_id: AtomicI64::new(1),
            hmac_key: rand::random(),
            read_only: AtomicBool::new(false),
        }
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Number of LOBs currently held.
    pub fn len(&self) -> usize {
        self.lobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lobs.is_empty()
    }

    /// Table id a LOB is currently assigned to.
    pub fn table_of(&self, lob_id: i64) -> Option<i32> {
        self.lobs.get(&lob_id).map(|lob| lob.table_id)
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.is_read_only() {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }

    fn mac(&self, lob_id: i64, data: &[u8]) -> StorageResult<Hmac<Sha256>> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.hmac_key)
            .map_err(|e| StorageError::Internal(format!("invalid hmac key: {}", e)))?;
        mac.update(&lob_id.to_le_bytes());
        mac.update(data);
        Ok(mac)
    }

    fn insert(&self, data: Bytes, table_id: i32, precision: u64) -> StorageResult<LobRef> {
        let lob_id = self.next_lob_id.fetch_add(1, Ordering::SeqCst);
        let hmac = self.mac(lob_id, &data)?.finalize().into_bytes().to_vec();
        trace!(
            "Stored lob {} ({} bytes, precision {}) for table {}",
            lob_id,
            data.len(),
            precision,
            table_id
        );
        self.lobs.insert(
            lob_id,
            StoredLob {
                data,
                table_id,
                precision,
            },
        );

        Ok(LobRef {
            lob_id,
            hmac,
            table_id,
            precision,
        })
    }
}

impl Default for MemoryLobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LobStore for MemoryLobStore {
    fn create_lob(
        &self,
        kind: LobKind,
        source: &mut dyn Read,
        max_length: Option<u64>,
    ) -> StorageResult<LobRef> {
        self.check_writable()?;
        let describe = |e: io::Error| StorageError::conversion(e, format!("{} stream", kind));

        let (data, precision) = match kind {
            LobKind::Blob => {
                let mut data = Vec::new();
                match max_length {
                    Some(max) => source.take(max).read_to_end(&mut data),
                    None => source.read_to_end(&mut data),
                }
                .map_err(describe)?;
                let precision = data.len() as u64;
                (data, precision)
            }
            LobKind::Clob => {
                let mut reader = BufReader::new(source);
                let mut text = String::new();
                let limit = max_length.map_or(usize::MAX, |m| m.min(usize::MAX as u64) as usize);
                let chars = read_chars(&mut reader, &mut text, limit).map_err(describe)?;
                (text.into_bytes(), chars as u64)
            }
        };

        self.insert(Bytes::from(data), TABLE_TEMP, precision)
    }

    fn input_stream(
        &self,
        lob_id: i64,
        hmac: &[u8],
        byte_count: i64,
    ) -> StorageResult<Box<dyn Read + Send>> {
        let data = self
            .lobs
            .get(&lob_id)
            .map(|lob| lob.data.clone())
            .ok_or(StorageError::LobNotFound(lob_id))?;

        self.mac(lob_id, &data)?
            .verify_slice(hmac)
            .map_err(|_| StorageError::IntegrityCheckFailed { lob_id })?;

        if byte_count >= 0 && byte_count as u64 != data.len() as u64 {
            return Err(StorageError::Corruption(format!(
                "lob {} has {} bytes, expected {}",
                lob_id,
                data.len(),
                byte_count
            )));
        }

        Ok(Box::new(Cursor::new(data)))
    }

    fn copy_lob(&self, lob_id: i64, table_id: i32, precision: u64) -> StorageResult<LobRef> {
        self.check_writable()?;
        let data = self
            .lobs
            .get(&lob_id)
            .map(|lob| lob.data.clone())
            .ok_or(StorageError::LobNotFound(lob_id))?;

        let copy = self.insert(data, table_id, precision)?;
        debug!("Copied lob {} to {} for table {}", lob_id, copy.lob_id, table_id);
        Ok(copy)
    }

    fn set_table(&self, lob_id: i64, table_id: i32) -> StorageResult<()> {
        self.check_writable()?;
        let mut lob = self
            .lobs
            .get_mut(&lob_id)
            .ok_or(StorageError::LobNotFound(lob_id))?;
        debug!(
            "Moved lob {} from table {} to table {}",
            lob_id, lob.table_id, table_id
        );
        lob.table_id = table_id;
        Ok(())
    }

    fn remove_lob(&self, lob_id: i64) -> StorageResult<()> {
        if let Some((_, lob)) = self.lobs.remove(&lob_id) {
            trace!(
                "Removed lob {} (table {}, precision {})",
                lob_id,
                lob.table_id,
                lob.precision
            );
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }
}
