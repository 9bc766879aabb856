//! Storage layer collaborators of the value layer.
//!
//! - **TempFile**: Scratch file holding a spilled LOB, deleted unless promoted
//! - **LobStore**: Durable object store addressed by LOB id and HMAC
//! - **StorageError**: Error kinds surfaced by every storage operation

pub mod error;
pub mod file;
pub mod lob_store;

pub use error::{StorageError, StorageResult};
pub use file::{TempFile, TempFileReader};
pub use lob_store::{
    LobRef, LobStore, MemoryLobStore, TABLE_ID_SESSION_VARIABLE, TABLE_RESULT, TABLE_TEMP,
};
