//! Value layer: large objects and the generic storage codec.
//!
//! - **LobValue**: CLOB/BLOB kept inline, in a temp file, or in the durable store
//! - **SerializedObjectType**: Fallback codec for objects without a specialized encoding
//! - **buffer_size**: Chunk sizing used while streaming LOB content

pub mod codec;
pub mod lob;
pub mod sizing;
pub mod text;

pub use codec::{SerializedObjectType, StorageDataType, StorageObject};
pub use lob::{LobStorage, LobValue};
pub use sizing::buffer_size;

use crate::storage::error::{StorageError, StorageResult};
use std::fmt;

/// Kind of a large object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LobKind {
    /// Character data; precision counts characters.
    Clob,
    /// Binary data; precision counts bytes.
    Blob,
}

impl fmt::Display for LobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LobKind::Clob => write!(f, "CLOB"),
            LobKind::Blob => write!(f, "BLOB"),
        }
    }
}

/// One-byte tags identifying an encoding in storage buffers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Int = 2,
    Text = 4,
    Bytes = 5,
    SerializedObject = 19,
}

impl TypeTag {
    pub fn from_u8(value: u8) -> StorageResult<Self> {
        match value {
            2 => Ok(TypeTag::Int),
            4 => Ok(TypeTag::Text),
            5 => Ok(TypeTag::Bytes),
            19 => Ok(TypeTag::SerializedObject),
            _ => Err(StorageError::Corruption(format!(
                "Unknown type tag: {}",
                value
            ))),
        }
    }
}

/// Typed values handed to the storage engine.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    String(String),
    Lob(LobValue),
}

impl Value {
    /// Get the LOB kind of this value, if it is a LOB
    pub fn lob_kind(&self) -> Option<LobKind> {
        match self {
            Value::Lob(lob) => Some(lob.kind()),
            _ => None,
        }
    }
}

impl From<LobValue> for Value {
    fn from(lob: LobValue) -> Self {
        Value::Lob(lob)
    }
}
