//! CLOB and BLOB values.
//!
//! Small objects are kept in memory and stored in the row. Large objects are
//! spilled to a temporary file while they are being built, and live in the
//! durable LOB store once linked to a table.
//!
//! Lifecycle of a non-inline value:
//!
//! ```text
//! TempFile --link--> Durable(table) --unlink--> Durable(session variable)
//! ```
//!
//! `close` may be called in any non-inline state and releases the temp file
//! and the durable reference. Inline values never change storage.

use crate::database::DataHandler;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file::TempFile;
use crate::storage::lob_store::{LobRef, TABLE_ID_SESSION_VARIABLE, TABLE_RESULT, TABLE_TEMP};
use crate::value::sizing::{buffer_size, IO_BUFFER_SIZE};
use crate::value::text::{quote_sql, read_chars, to_hex};
use crate::value::{LobKind, Value};
use bytes::Bytes;
use log::{debug, trace};
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, BufRead, BufReader, BufWriter, Cursor, Read, Write};
use std::sync::{Arc, OnceLock};

/// Values up to this precision are traced with their full content.
pub const MAX_TRACE_DATA_LENGTH: u64 = 65535;

/// Above this precision the hash code is derived from the precision alone.
const HASH_PRECISION_LIMIT: u64 = 4096;

/// Byte stream over the content of a LOB. CLOB content is UTF-8.
pub type LobStream = Box<dyn BufRead + Send>;

/// Where the content of a [`LobValue`] lives.
#[derive(Debug, Clone)]
pub enum LobStorage {
    Inline(Bytes),
    TempFile(Arc<TempFile>),
    Durable {
        lob_id: i64,
        hmac: Vec<u8>,
        table_id: i32,
    },
}

/// A CLOB or BLOB value.
#[derive(Clone)]
pub struct LobValue {
    kind: LobKind,
    /// Length in characters (CLOB) or bytes (BLOB).
    precision: u64,
    storage: LobStorage,
    handler: Option<Arc<dyn DataHandler>>,
    hash: OnceLock<u64>,
}

impl LobValue {
    fn new(
        kind: LobKind,
        precision: u64,
        storage: LobStorage,
        handler: Option<Arc<dyn DataHandler>>,
    ) -> Self {
        Self {
            kind,
            precision,
            storage,
            handler,
            hash: OnceLock::new(),
        }
    }

    fn inline(kind: LobKind, data: Bytes, precision: u64) -> Self {
        Self::new(kind, precision, LobStorage::Inline(data), None)
    }

    fn from_lob_ref(kind: LobKind, handler: Arc<dyn DataHandler>, lob: LobRef) -> Self {
        Self::create_from_durable(
            kind,
            handler,
            lob.table_id,
            lob.lob_id,
            lob.hmac,
            lob.precision,
        )
    }

    /// Create a LOB kept in memory. CLOB data must be UTF-8.
    pub fn create_inline(kind: LobKind, data: impl Into<Bytes>) -> StorageResult<Self> {
        let data = data.into();
        let precision = match kind {
            LobKind::Blob => data.len() as u64,
            LobKind::Clob => std::str::from_utf8(&data)
                .map_err(|e| {
                    StorageError::conversion(io::Error::new(io::ErrorKind::InvalidData, e), kind)
                })?
                .chars()
                .count() as u64,
        };
        Ok(Self::inline(kind, data, precision))
    }

    /// Reference a LOB already held by the durable store.
    pub fn create_from_durable(
        kind: LobKind,
        handler: Arc<dyn DataHandler>,
        table_id: i32,
        lob_id: i64,
        hmac: Vec<u8>,
        precision: u64,
    ) -> Self {
        Self::new(
            kind,
            precision,
            LobStorage::Durable {
                lob_id,
                hmac,
                table_id,
            },
            Some(handler),
        )
    }

    /// Create a LOB from a stream, reading at most `max_length` characters
    /// (CLOB, UTF-8 source) or bytes (BLOB).
    ///
    /// Content that fits the handler's inline limit is kept in memory;
    /// anything larger is spilled to a new temp file.
    pub fn create_temp_from_stream<R: Read>(
        kind: LobKind,
        source: R,
        max_length: Option<u64>,
        handler: &Arc<dyn DataHandler>,
    ) -> StorageResult<Self> {
        match kind {
            LobKind::Blob => {
                let mut source = source;
                Self::create_temp(kind, max_length, handler, |len, buf| {
                    buf.clear();
                    let n = source.by_ref().take(len as u64).read_to_end(buf)?;
                    Ok(n as u64)
                })
            }
            LobKind::Clob => {
                let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, source);
                Self::create_temp(kind, max_length, handler, |len, buf| {
                    let mut text = String::new();
                    let n = read_chars(&mut reader, &mut text, len)?;
                    *buf = text.into_bytes();
                    Ok(n as u64)
                })
            }
        }
    }

    /// `next_chunk(len, buf)` replaces `buf` with the encoding of up to `len`
    /// units and returns how many units it read.
    fn create_temp<F>(
        kind: LobKind,
        max_length: Option<u64>,
        handler: &Arc<dyn DataHandler>,
        mut next_chunk: F,
    ) -> StorageResult<Self>
    where
        F: FnMut(usize, &mut Vec<u8>) -> io::Result<u64>,
    {
        let inplace = handler.max_length_inplace_lob();
        let compress = handler.lob_compression_algorithm(kind).is_some();
        let stream_error = |e: io::Error| StorageError::conversion(e, format!("{} stream", kind));

        let mut remaining = max_length.map_or(i64::MAX, |max| max.min(i64::MAX as u64) as i64);
        let mut buf = Vec::new();
        let mut units = next_chunk(buffer_size(inplace, compress, remaining), &mut buf)
            .map_err(stream_error)?;
        if units <= inplace as u64 {
            return Ok(Self::inline(kind, Bytes::from(buf), units));
        }

        let (temp, file) = TempFile::create(&handler.temp_file_prefix(), handler.lob_sync().clone())?;
        let temp = Arc::new(temp);
        let file_error = |e: io::Error| StorageError::conversion(e, temp.path().display());
        let mut out = BufWriter::with_capacity(IO_BUFFER_SIZE, file);

        let mut precision = 0u64;
        loop {
            out.write_all(&buf).map_err(file_error)?;
            precision += units;
            remaining = remaining.saturating_sub(units as i64);
            if remaining <= 0 {
                break;
            }
            units = next_chunk(buffer_size(inplace, compress, remaining), &mut buf)
                .map_err(stream_error)?;
            if units == 0 {
                break;
            }
        }
        out.flush().map_err(file_error)?;
        drop(out);

        debug!(
            "Spilled {} of precision {} to {:?}",
            kind,
            precision,
            temp.path()
        );
        Ok(Self::new(
            kind,
            precision,
            LobStorage::TempFile(temp),
            Some(handler.clone()),
        ))
    }

    pub fn kind(&self) -> LobKind {
        self.kind
    }

    pub fn precision(&self) -> u64 {
        self.precision
    }

    pub fn storage(&self) -> &LobStorage {
        &self.storage
    }

    /// Content of an inline value.
    pub fn small(&self) -> Option<&Bytes> {
        match &self.storage {
            LobStorage::Inline(data) => Some(data),
            _ => None,
        }
    }

    /// Table id owning this value; 0 for inline values.
    pub fn table_id(&self) -> i32 {
        match &self.storage {
            LobStorage::Inline(_) => 0,
            LobStorage::TempFile(_) => TABLE_TEMP,
            LobStorage::Durable { table_id, .. } => *table_id,
        }
    }

    /// Durable store id; 0 when not stored.
    pub fn lob_id(&self) -> i64 {
        match &self.storage {
            LobStorage::Durable { lob_id, .. } => *lob_id,
            _ => 0,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.small().is_none() && self.table_id() != TABLE_ID_SESSION_VARIABLE
    }

    pub fn is_stored(&self) -> bool {
        matches!(self.storage, LobStorage::Durable { .. })
    }

    fn require_handler(&self) -> StorageResult<&Arc<dyn DataHandler>> {
        self.handler
            .as_ref()
            .ok_or_else(|| StorageError::Internal(format!("{} has no data handler", self)))
    }

    fn io_error(&self, e: io::Error) -> StorageError {
        StorageError::conversion(e, self)
    }

    /// Open the content as a byte stream.
    pub fn as_stream(&self) -> StorageResult<LobStream> {
        match &self.storage {
            LobStorage::Inline(data) => Ok(Box::new(Cursor::new(data.clone()))),
            LobStorage::TempFile(file) => {
                let close_between_reads = self
                    .handler
                    .as_ref()
                    .is_some_and(|h| h.lob_close_between_reads());
                Ok(Box::new(BufReader::with_capacity(
                    IO_BUFFER_SIZE,
                    file.reader(close_between_reads),
                )))
            }
            LobStorage::Durable { lob_id, hmac, .. } => {
                let byte_count = match self.kind {
                    LobKind::Blob => self.precision as i64,
                    LobKind::Clob => -1,
                };
                let stream = self
                    .require_handler()?
                    .lob_store()
                    .input_stream(*lob_id, hmac, byte_count)?;
                Ok(Box::new(BufReader::with_capacity(IO_BUFFER_SIZE, stream)))
            }
        }
    }

    /// Read at most `max_chars` characters of CLOB content.
    pub fn read_string(&self, max_chars: usize) -> StorageResult<String> {
        let mut stream = self.as_stream()?;
        let mut text = String::new();
        read_chars(&mut stream, &mut text, max_chars).map_err(|e| self.io_error(e))?;
        Ok(text)
    }

    /// Text of a CLOB, or uppercase hex of a BLOB.
    pub fn string(&self) -> StorageResult<String> {
        match self.kind {
            LobKind::Clob => {
                let limit = if self.precision == 0 || self.precision > usize::MAX as u64 {
                    usize::MAX
                } else {
                    self.precision as usize
                };
                self.read_string(limit)
            }
            LobKind::Blob => Ok(to_hex(&self.bytes()?)),
        }
    }

    /// Raw content; UTF-8 bytes for a CLOB.
    pub fn bytes(&self) -> StorageResult<Vec<u8>> {
        if let LobStorage::Inline(data) = &self.storage {
            return Ok(data.to_vec());
        }
        let mut data = Vec::new();
        self.as_stream()?
            .read_to_end(&mut data)
            .map_err(|e| self.io_error(e))?;
        Ok(data)
    }

    /// Move this value into table `table_id` and return the linked value.
    ///
    /// A temp-file value is copied into the durable store. The temp file
    /// stays readable for clones sharing it and is deleted once the last of
    /// them is dropped or closed. A stored value
    /// not yet owned by a table is reassigned in place, any other stored
    /// value is copied. Inline values larger than the inline limit are
    /// promoted first; smaller inline values are returned unchanged.
    pub fn link(&mut self, handler: &Arc<dyn DataHandler>, table_id: i32) -> StorageResult<LobValue> {
        match &mut self.storage {
            LobStorage::Inline(data) => {
                if data.len() <= handler.max_length_inplace_lob() {
                    return Ok(self.clone());
                }
                let mut source: &[u8] = data;
                let lob = handler
                    .lob_store()
                    .create_lob(self.kind, &mut source, Some(self.precision))?;
                let mut promoted = Self::from_lob_ref(self.kind, handler.clone(), lob);
                promoted.link(handler, table_id)
            }
            LobStorage::TempFile(file) => {
                let path = file.path().to_path_buf();
                let linked = self.copy_into_store(handler, table_id)?;
                debug!("Linked temp lob {:?} as lob {}", path, linked.lob_id());
                *self = linked.clone();
                Ok(linked)
            }
            LobStorage::Durable {
                lob_id,
                table_id: current,
                ..
            } if *current == TABLE_TEMP => {
                handler.lob_store().set_table(*lob_id, table_id)?;
                *current = table_id;
                Ok(self.clone())
            }
            LobStorage::Durable { .. } => self.copy_into_store(handler, table_id),
        }
    }

    /// Hand this value over to the session: its table id becomes the
    /// session-variable id. No-op for inline, temp or already unlinked values.
    pub fn unlink(&mut self, handler: &Arc<dyn DataHandler>) -> StorageResult<()> {
        if let LobStorage::Durable {
            lob_id, table_id, ..
        } = &mut self.storage
        {
            if *table_id != TABLE_ID_SESSION_VARIABLE {
                handler
                    .lob_store()
                    .set_table(*lob_id, TABLE_ID_SESSION_VARIABLE)?;
                debug!("Unlinked lob {} from table {}", lob_id, table_id);
                *table_id = TABLE_ID_SESSION_VARIABLE;
            }
        }
        Ok(())
    }

    fn copy_into_store(&self, handler: &Arc<dyn DataHandler>, table_id: i32) -> StorageResult<LobValue> {
        let store = handler.lob_store();
        let lob = match &self.storage {
            LobStorage::Durable { lob_id, .. } => store.copy_lob(*lob_id, table_id, self.precision)?,
            _ => {
                let mut source = self.as_stream()?;
                let mut lob = store.create_lob(self.kind, &mut source, Some(self.precision))?;
                store.set_table(lob.lob_id, table_id)?;
                lob.table_id = table_id;
                lob
            }
        };
        trace!("Copied {} into lob {} for table {}", self, lob.lob_id, table_id);
        Ok(Self::from_lob_ref(self.kind, handler.clone(), lob))
    }

    /// Release the temp file and the durable reference.
    pub fn close(&self) -> StorageResult<()> {
        if let LobStorage::TempFile(file) = &self.storage {
            file.stop_auto_delete();
            file.delete()?;
        }
        if let (Some(handler), LobStorage::Durable { lob_id, .. }) = (&self.handler, &self.storage) {
            handler.lob_store().remove_lob(*lob_id)?;
        }
        Ok(())
    }

    /// An independent copy for temporary use. Content is owned privately
    /// once built, so this is the value itself.
    pub fn copy_to_temp(&self) -> LobValue {
        self.clone()
    }

    /// A copy bound to a result set; the value itself when there is no
    /// handler or the store is read-only.
    pub fn copy_to_result(&self) -> StorageResult<LobValue> {
        let Some(handler) = &self.handler else {
            return Ok(self.clone());
        };
        if handler.lob_store().is_read_only() {
            return Ok(self.clone());
        }
        self.copy_into_store(handler, TABLE_RESULT)
    }

    /// Truncate to `precision` characters or bytes.
    pub fn convert_precision(&self, precision: u64, _force: bool) -> StorageResult<LobValue> {
        if self.precision <= precision {
            return Ok(self.clone());
        }

        let mut source = self.as_stream()?;
        if let Some(handler) = &self.handler {
            return Self::create_temp_from_stream(self.kind, source, Some(precision), handler);
        }

        let limit = precision.min(usize::MAX as u64) as usize;
        match self.kind {
            LobKind::Blob => {
                let mut data = Vec::new();
                source
                    .take(precision)
                    .read_to_end(&mut data)
                    .map_err(|e| self.io_error(e))?;
                let len = data.len() as u64;
                Ok(Self::inline(self.kind, Bytes::from(data), len))
            }
            LobKind::Clob => {
                let mut text = String::new();
                let chars = read_chars(&mut source, &mut text, limit).map_err(|e| self.io_error(e))?;
                Ok(Self::inline(self.kind, Bytes::from(text), chars as u64))
            }
        }
    }

    /// Convert between CLOB and BLOB. BLOB content that is not valid UTF-8
    /// is decoded lossily.
    pub fn convert_to(&self, kind: LobKind) -> StorageResult<Value> {
        if kind == self.kind {
            return Ok(Value::Lob(self.clone()));
        }
        if let LobStorage::Inline(data) = &self.storage {
            let data = match kind {
                LobKind::Clob => Bytes::from(String::from_utf8_lossy(data).into_owned()),
                LobKind::Blob => data.clone(),
            };
            return Ok(Value::Lob(Self::create_inline(kind, data)?));
        }

        let handler = self.require_handler()?;
        let lob = match kind {
            // invalid UTF-8 sequences become U+FFFD
            LobKind::Clob => {
                let text = String::from_utf8_lossy(&self.bytes()?).into_owned();
                handler
                    .lob_store()
                    .create_lob(kind, &mut text.as_bytes(), None)?
            }
            LobKind::Blob => {
                let mut source = self.as_stream()?;
                handler.lob_store().create_lob(kind, &mut source, None)?
            }
        };
        Ok(Value::Lob(Self::from_lob_ref(kind, handler.clone(), lob)))
    }

    /// Compare content. CLOBs (or a CLOB against a BLOB) compare as text,
    /// BLOBs as signed bytes.
    pub fn compare(&self, other: &LobValue) -> StorageResult<Ordering> {
        if std::ptr::eq(self, other) {
            return Ok(Ordering::Equal);
        }
        match (&self.storage, &other.storage) {
            (LobStorage::Durable { lob_id: a, .. }, LobStorage::Durable { lob_id: b, .. })
                if a == b =>
            {
                return Ok(Ordering::Equal);
            }
            (LobStorage::TempFile(a), LobStorage::TempFile(b)) if Arc::ptr_eq(a, b) => {
                return Ok(Ordering::Equal);
            }
            _ => {}
        }

        if self.kind == LobKind::Clob || other.kind == LobKind::Clob {
            Ok(self.string()?.cmp(&other.string()?))
        } else {
            Ok(compare_signed(&self.bytes()?, &other.bytes()?))
        }
    }

    pub fn hash_code(&self) -> StorageResult<u64> {
        if self.precision > HASH_PRECISION_LIMIT {
            return Ok(self.precision ^ (self.precision >> 32));
        }
        if let Some(hash) = self.hash.get() {
            return Ok(*hash);
        }

        let mut hasher = DefaultHasher::new();
        match self.kind {
            LobKind::Clob => self.string()?.hash(&mut hasher),
            LobKind::Blob => self.bytes()?.hash(&mut hasher),
        }
        let hash = hasher.finish();
        let _ = self.hash.set(hash);
        Ok(hash)
    }

    /// Estimated memory footprint in bytes.
    pub fn memory(&self) -> usize {
        match &self.storage {
            LobStorage::Inline(data) => data.len() + 104,
            _ => 140,
        }
    }

    /// Full SQL literal. Reads the whole content.
    pub fn sql(&self) -> StorageResult<String> {
        match self.kind {
            LobKind::Clob => Ok(quote_sql(&self.string()?)),
            LobKind::Blob => Ok(format!("X'{}'", to_hex(&self.bytes()?))),
        }
    }

    /// SQL for trace output. Large values are rendered as a placeholder
    /// carrying only their metadata.
    pub fn trace_sql(&self) -> String {
        if let LobStorage::Inline(data) = &self.storage {
            if self.precision <= MAX_TRACE_DATA_LENGTH {
                return match self.kind {
                    LobKind::Clob => quote_sql(&String::from_utf8_lossy(data)),
                    LobKind::Blob => format!("X'{}'", to_hex(data)),
                };
            }
        }

        let mut buff = match self.kind {
            LobKind::Clob => format!("SPACE({}", self.precision),
            LobKind::Blob => format!("CAST(REPEAT('00', {}) AS BINARY", self.precision),
        };
        buff.push_str(&format!(
            " /* table: {} id: {} */)",
            self.table_id(),
            self.lob_id()
        ));
        buff
    }
}

fn compare_signed(a: &[u8], b: &[u8]) -> Ordering {
    a.iter().map(|&x| x as i8).cmp(b.iter().map(|&x| x as i8))
}

impl fmt::Display for LobValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = match &self.storage {
            LobStorage::TempFile(file) => file.path().display().to_string(),
            _ => "null".to_string(),
        };
        write!(
            f,
            "lob: {} table: {} id: {}",
            file,
            self.table_id(),
            self.lob_id()
        )
    }
}

impl fmt::Debug for LobValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LobValue")
            .field("kind", &self.kind)
            .field("precision", &self.precision)
            .field("storage", &self.storage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, DatabaseConfig};
    use crate::storage::lob_store::MemoryLobStore;
    use anyhow::Result;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn setup(inline_limit: usize) -> Result<(TempDir, Arc<dyn DataHandler>)> {
        let dir = tempdir()?;
        let config = DatabaseConfig {
            max_length_inplace_lob: inline_limit,
            ..Default::default()
        };
        let db = Database::open(&dir.path().join("test.db"), config)?;
        Ok((dir, db.handler()))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn read_all(lob: &LobValue) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        lob.as_stream()?.read_to_end(&mut data)?;
        Ok(data)
    }

    fn temp_path(lob: &LobValue) -> &Path {
        match lob.storage() {
            LobStorage::TempFile(file) => file.path(),
            other => panic!("expected temp file storage, got {:?}", other),
        }
    }

    #[test]
    fn test_create_inline_precision() -> Result<()> {
        let blob = LobValue::create_inline(LobKind::Blob, vec![1u8, 2, 3])?;
        assert_eq!(blob.precision(), 3);

        let clob = LobValue::create_inline(LobKind::Clob, "naïve".as_bytes().to_vec())?;
        assert_eq!(clob.precision(), 5);
        assert_eq!(clob.string()?, "naïve");
        assert!(!clob.is_linked());
        assert!(!clob.is_stored());
        Ok(())
    }

    #[test]
    fn test_create_inline_clob_rejects_invalid_utf8() {
        let result = LobValue::create_inline(LobKind::Clob, vec![0xFFu8, 0xFE]);
        assert!(matches!(result, Err(StorageError::Conversion { .. })));
    }

    #[test]
    fn test_inline_threshold_boundary() -> Result<()> {
        let (_dir, handler) = setup(100)?;

        let at = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(100)[..], None, &handler)?;
        assert!(at.small().is_some());
        assert_eq!(at.precision(), 100);

        let over = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(101)[..], None, &handler)?;
        assert!(over.small().is_none());
        assert_eq!(over.precision(), 101);
        assert_eq!(read_all(&over)?, pattern(101));

        let text = "é".repeat(100);
        let at = LobValue::create_temp_from_stream(LobKind::Clob, text.as_bytes(), None, &handler)?;
        assert!(at.small().is_some());
        assert_eq!(at.precision(), 100);

        let text = "é".repeat(101);
        let over = LobValue::create_temp_from_stream(LobKind::Clob, text.as_bytes(), None, &handler)?;
        assert!(over.small().is_none());
        assert_eq!(over.precision(), 101);
        assert_eq!(over.string()?, text);
        Ok(())
    }

    #[test]
    fn test_spill_large_clob_across_chunks() -> Result<()> {
        let (_dir, handler) = setup(16)?;
        let text: String = (0..20_000)
            .map(|i| ['a', 'ß', '€', '😀'][i % 4])
            .collect();

        let lob = LobValue::create_temp_from_stream(LobKind::Clob, text.as_bytes(), None, &handler)?;
        assert_eq!(lob.precision(), 20_000);
        assert_eq!(lob.string()?, text);
        assert_eq!(lob.read_string(3)?, "aß€");
        Ok(())
    }

    #[test]
    fn test_max_length_is_respected() -> Result<()> {
        let (_dir, handler) = setup(64)?;

        let lob = LobValue::create_temp_from_stream(
            LobKind::Blob,
            &pattern(50_000)[..],
            Some(10_000),
            &handler,
        )?;
        assert_eq!(lob.precision(), 10_000);
        assert_eq!(read_all(&lob)?, pattern(10_000));

        let lob = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(500)[..], Some(20), &handler)?;
        assert_eq!(lob.small().map(|s| s.len()), Some(20));

        let lob = LobValue::create_temp_from_stream(LobKind::Clob, "xyz".as_bytes(), Some(0), &handler)?;
        assert_eq!(lob.precision(), 0);
        Ok(())
    }

    #[test]
    fn test_close_deletes_temp_file_once() -> Result<()> {
        let (dir, handler) = setup(10)?;
        let lob = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(1000)[..], None, &handler)?;
        let path = temp_path(&lob).to_path_buf();
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());

        lob.close()?;
        assert!(!path.exists());
        lob.close()?;
        Ok(())
    }

    #[test]
    fn test_drop_removes_unclosed_temp_file() -> Result<()> {
        let (_dir, handler) = setup(10)?;
        let lob = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(1000)[..], None, &handler)?;
        let copy = lob.copy_to_temp();
        let path = temp_path(&lob).to_path_buf();

        drop(lob);
        assert!(path.exists());
        assert_eq!(read_all(&copy)?, pattern(1000));
        drop(copy);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_close_between_reads() -> Result<()> {
        let dir = tempdir()?;
        let config = DatabaseConfig {
            max_length_inplace_lob: 10,
            lob_close_between_reads: true,
            ..Default::default()
        };
        let handler = Database::open(&dir.path().join("test.db"), config)?.handler();

        let lob = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(20_000)[..], None, &handler)?;
        assert_eq!(read_all(&lob)?, pattern(20_000));
        Ok(())
    }

    #[test]
    fn test_compression_uses_smaller_chunks() -> Result<()> {
        let dir = tempdir()?;
        let config = DatabaseConfig {
            max_length_inplace_lob: 10,
            lob_compression_algorithm: Some("lzf".to_string()),
            ..Default::default()
        };
        let handler = Database::open(&dir.path().join("test.db"), config)?.handler();

        let lob = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(9_000)[..], None, &handler)?;
        assert_eq!(lob.precision(), 9_000);
        assert_eq!(read_all(&lob)?, pattern(9_000));
        Ok(())
    }

    #[test]
    fn test_link_temp_file_promotes_to_store() -> Result<()> {
        let (_dir, handler) = setup(10)?;
        let mut lob = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(5000)[..], None, &handler)?;
        let path = temp_path(&lob).to_path_buf();

        let linked = lob.link(&handler, 42)?;
        assert!(linked.is_stored());
        assert!(linked.is_linked());
        assert_eq!(linked.table_id(), 42);
        assert_eq!(lob.lob_id(), linked.lob_id());
        assert!(!path.exists());
        assert_eq!(read_all(&linked)?, pattern(5000));
        Ok(())
    }

    #[test]
    fn test_copy_to_temp_stays_readable_after_link() -> Result<()> {
        let (_dir, handler) = setup(10)?;
        let mut lob = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(1000)[..], None, &handler)?;
        let copy = lob.copy_to_temp();
        let path = temp_path(&copy).to_path_buf();

        let linked = lob.link(&handler, 7)?;
        assert!(linked.is_stored());
        assert!(path.exists());
        assert_eq!(read_all(&copy)?, pattern(1000));
        assert_eq!(read_all(&linked)?, pattern(1000));

        drop(copy);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_link_stored_value_in_temp_table_is_in_place() -> Result<()> {
        let (_dir, handler) = setup(10)?;
        let lob_ref = handler
            .lob_store()
            .create_lob(LobKind::Blob, &mut &pattern(100)[..], None)?;
        let mut lob = LobValue::from_lob_ref(LobKind::Blob, handler.clone(), lob_ref);
        let lob_id = lob.lob_id();

        let linked = lob.link(&handler, 7)?;
        assert_eq!(linked.lob_id(), lob_id);
        assert_eq!(lob.table_id(), 7);

        // already owned by a table: linking again copies
        let copy = lob.link(&handler, 8)?;
        assert_ne!(copy.lob_id(), lob_id);
        assert_eq!(copy.table_id(), 8);
        assert_eq!(lob.table_id(), 7);
        assert_eq!(read_all(&copy)?, pattern(100));
        Ok(())
    }

    #[test]
    fn test_link_inline_value() -> Result<()> {
        let (_dir, handler) = setup(10)?;

        let mut small = LobValue::create_inline(LobKind::Blob, pattern(10))?;
        let linked = small.link(&handler, 3)?;
        assert_eq!(linked.small().map(|s| s.to_vec()), Some(pattern(10)));

        // built inline under a larger limit, then linked into a smaller one
        let mut large = LobValue::create_inline(LobKind::Clob, "x".repeat(50).into_bytes())?;
        let linked = large.link(&handler, 3)?;
        assert!(linked.is_stored());
        assert_eq!(linked.table_id(), 3);
        assert_eq!(linked.precision(), 50);
        assert_eq!(linked.string()?, "x".repeat(50));
        assert!(large.small().is_some());
        Ok(())
    }

    #[test]
    fn test_unlink_is_idempotent() -> Result<()> {
        let (_dir, handler) = setup(10)?;
        let mut lob = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(100)[..], None, &handler)?;
        lob.link(&handler, 5)?;

        lob.unlink(&handler)?;
        assert_eq!(lob.table_id(), TABLE_ID_SESSION_VARIABLE);
        assert!(!lob.is_linked());
        lob.unlink(&handler)?;
        assert_eq!(lob.table_id(), TABLE_ID_SESSION_VARIABLE);

        let mut inline = LobValue::create_inline(LobKind::Blob, vec![1u8])?;
        inline.unlink(&handler)?;
        assert_eq!(inline.table_id(), 0);
        Ok(())
    }

    #[test]
    fn test_close_releases_durable_reference() -> Result<()> {
        let dir = tempdir()?;
        let store = Arc::new(MemoryLobStore::new());
        let config = DatabaseConfig {
            max_length_inplace_lob: 10,
            ..Default::default()
        };
        let handler: Arc<dyn DataHandler> =
            Database::with_lob_store(&dir.path().join("test.db"), config, store.clone());

        let mut lob = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(100)[..], None, &handler)?;
        let linked = lob.link(&handler, 1)?;
        assert_eq!(store.len(), 1);

        linked.close()?;
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn test_copy_to_result() -> Result<()> {
        let dir = tempdir()?;
        let store = Arc::new(MemoryLobStore::new());
        let config = DatabaseConfig {
            max_length_inplace_lob: 10,
            ..Default::default()
        };
        let handler: Arc<dyn DataHandler> =
            Database::with_lob_store(&dir.path().join("test.db"), config, store.clone());

        let inline = LobValue::create_inline(LobKind::Blob, vec![9u8])?;
        assert!(inline.copy_to_result()?.small().is_some());

        let mut lob = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(100)[..], None, &handler)?;
        lob.link(&handler, 1)?;

        let result = lob.copy_to_result()?;
        assert_eq!(result.table_id(), TABLE_RESULT);
        assert_ne!(result.lob_id(), lob.lob_id());
        assert_eq!(result.precision(), 100);
        assert_eq!(read_all(&result)?, pattern(100));

        store.set_read_only(true);
        let same = lob.copy_to_result()?;
        assert_eq!(same.lob_id(), lob.lob_id());
        Ok(())
    }

    #[test]
    fn test_convert_precision() -> Result<()> {
        let (_dir, handler) = setup(10)?;

        let inline = LobValue::create_inline(LobKind::Clob, "héllo".as_bytes().to_vec())?;
        let same = inline.convert_precision(5, false)?;
        assert_eq!(same.precision(), 5);
        let cut = inline.convert_precision(2, false)?;
        assert_eq!(cut.precision(), 2);
        assert_eq!(cut.string()?, "hé");

        let lob = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(1000)[..], None, &handler)?;
        let cut = lob.convert_precision(500, true)?;
        assert_eq!(cut.precision(), 500);
        assert_eq!(read_all(&cut)?, pattern(500));

        let cut = lob.convert_precision(4, true)?;
        assert!(cut.small().is_some());
        assert_eq!(read_all(&cut)?, pattern(4));

        let text: String = "aé€😀".repeat(2000);
        let clob = LobValue::create_temp_from_stream(LobKind::Clob, text.as_bytes(), None, &handler)?;
        assert_eq!(clob.precision(), 8000);
        let cut = clob.convert_precision(4097, false)?;
        assert_eq!(cut.precision(), 4097);
        assert!(matches!(cut.storage(), LobStorage::TempFile(_)));
        let expected: String = text.chars().take(4097).collect();
        assert_eq!(cut.string()?, expected);

        let mut stored = clob.clone();
        let stored = stored.link(&handler, 3)?;
        let cut = stored.convert_precision(4095, false)?;
        assert_eq!(cut.precision(), 4095);
        let expected: String = text.chars().take(4095).collect();
        assert_eq!(cut.string()?, expected);
        Ok(())
    }

    #[test]
    fn test_convert_to() -> Result<()> {
        let (_dir, handler) = setup(10)?;

        let inline = LobValue::create_inline(LobKind::Clob, "abc".as_bytes().to_vec())?;
        let Value::Lob(blob) = inline.convert_to(LobKind::Blob)? else {
            panic!("expected a lob");
        };
        assert_eq!(blob.kind(), LobKind::Blob);
        assert_eq!(blob.bytes()?, b"abc");

        let text = "ü".repeat(40);
        let clob = LobValue::create_temp_from_stream(LobKind::Clob, text.as_bytes(), None, &handler)?;
        let Value::Lob(blob) = clob.convert_to(LobKind::Blob)? else {
            panic!("expected a lob");
        };
        assert!(blob.is_stored());
        assert_eq!(blob.precision(), 80);
        assert_eq!(blob.bytes()?, text.as_bytes());

        let Value::Lob(same) = clob.convert_to(LobKind::Clob)? else {
            panic!("expected a lob");
        };
        assert_eq!(same.precision(), 40);
        Ok(())
    }

    #[test]
    fn test_convert_blob_to_clob_decodes_lossily() -> Result<()> {
        let (_dir, handler) = setup(10)?;

        let inline = LobValue::create_inline(LobKind::Blob, vec![b'a', 0xFF, b'b'])?;
        let Value::Lob(clob) = inline.convert_to(LobKind::Clob)? else {
            panic!("expected a lob");
        };
        assert_eq!(clob.kind(), LobKind::Clob);
        assert_eq!(clob.precision(), 3);
        assert_eq!(clob.string()?, "a\u{FFFD}b");

        let mut data = "ü".repeat(20).into_bytes();
        data.push(0xC3);
        let mut blob = LobValue::create_temp_from_stream(LobKind::Blob, &data[..], None, &handler)?;
        let stored = blob.link(&handler, 4)?;
        let Value::Lob(clob) = stored.convert_to(LobKind::Clob)? else {
            panic!("expected a lob");
        };
        assert!(clob.is_stored());
        assert_eq!(clob.precision(), 21);
        assert_eq!(clob.string()?, format!("{}\u{FFFD}", "ü".repeat(20)));
        Ok(())
    }

    #[test]
    fn test_compare() -> Result<()> {
        let (_dir, handler) = setup(10)?;

        let a = LobValue::create_inline(LobKind::Clob, "apple".as_bytes().to_vec())?;
        let b = LobValue::create_inline(LobKind::Clob, "banana".as_bytes().to_vec())?;
        assert_eq!(a.compare(&a)?, Ordering::Equal);
        assert_eq!(a.compare(&b)?, Ordering::Less);
        assert_eq!(b.compare(&a)?, Ordering::Greater);

        // bytes compare signed: 0x80 is -128
        let low = LobValue::create_inline(LobKind::Blob, vec![0x80u8])?;
        let high = LobValue::create_inline(LobKind::Blob, vec![0x01u8])?;
        assert_eq!(low.compare(&high)?, Ordering::Less);

        let mut spilled = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(100)[..], None, &handler)?;
        let linked = spilled.link(&handler, 1)?;
        assert_eq!(spilled.compare(&linked)?, Ordering::Equal);

        let other = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(100)[..], None, &handler)?;
        assert_eq!(other.compare(&linked)?, Ordering::Equal);
        Ok(())
    }

    #[test]
    fn test_hash_code() -> Result<()> {
        let (_dir, handler) = setup(10)?;

        let a = LobValue::create_inline(LobKind::Blob, pattern(50))?;
        let b = LobValue::create_temp_from_stream(LobKind::Blob, &pattern(50)[..], None, &handler)?;
        assert_eq!(a.hash_code()?, b.hash_code()?);
        assert_eq!(a.hash_code()?, a.hash_code()?);

        let big = LobValue::create_from_durable(LobKind::Blob, handler.clone(), 1, 99, vec![], 5000);
        assert_eq!(big.hash_code()?, 5000);
        Ok(())
    }

    #[test]
    fn test_trace_sql() -> Result<()> {
        let (_dir, handler) = setup(10)?;

        let clob = LobValue::create_inline(LobKind::Clob, "it's".as_bytes().to_vec())?;
        assert_eq!(clob.trace_sql(), "'it''s'");
        assert_eq!(clob.sql()?, "'it''s'");

        let blob = LobValue::create_inline(LobKind::Blob, vec![0xDEu8, 0xAD])?;
        assert_eq!(blob.trace_sql(), "X'DEAD'");

        let stored = LobValue::create_from_durable(LobKind::Clob, handler.clone(), 12, 34, vec![], 1_000_000);
        assert_eq!(stored.trace_sql(), "SPACE(1000000 /* table: 12 id: 34 */)");

        let stored = LobValue::create_from_durable(LobKind::Blob, handler, 12, 34, vec![], 100);
        assert_eq!(
            stored.trace_sql(),
            "CAST(REPEAT('00', 100) AS BINARY /* table: 12 id: 34 */)"
        );
        Ok(())
    }

    #[test]
    fn test_memory() -> Result<()> {
        let inline = LobValue::create_inline(LobKind::Blob, vec![0u8; 20])?;
        assert_eq!(inline.memory(), 124);

        let (_dir, handler) = setup(10)?;
        let stored = LobValue::create_from_durable(LobKind::Blob, handler, 1, 1, vec![], 100);
        assert_eq!(stored.memory(), 140);
        Ok(())
    }

    #[test]
    fn test_forged_hmac_is_integrity_error() -> Result<()> {
        let (_dir, handler) = setup(10)?;
        let lob_ref = handler
            .lob_store()
            .create_lob(LobKind::Blob, &mut &pattern(100)[..], None)?;

        let forged = LobValue::create_from_durable(
            LobKind::Blob,
            handler.clone(),
            lob_ref.table_id,
            lob_ref.lob_id,
            vec![0u8; 32],
            lob_ref.precision,
        );
        assert!(matches!(
            forged.bytes(),
            Err(StorageError::IntegrityCheckFailed { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_display() -> Result<()> {
        let (_dir, handler) = setup(10)?;
        let stored = LobValue::create_from_durable(LobKind::Blob, handler, 3, 4, vec![], 100);
        assert_eq!(stored.to_string(), "lob: null table: 3 id: 4");
        Ok(())
    }
}
