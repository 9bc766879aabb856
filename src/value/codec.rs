//! Storage codecs for objects written into pages.
//!
//! Objects with a specialized encoding (integers, text, byte strings) are
//! handled by their own [`StorageDataType`]. Everything else goes through
//! [`SerializedObjectType`], which writes
//!
//! ```text
//! [tag: 1 byte = 19][length: varint][bincode bytes: length]
//! ```
//!
//! and keeps a smoothed estimate of the serialized size for cost planning.

use crate::storage::error::{StorageError, StorageResult};
use crate::value::{TypeTag, Value};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::atomic::{self, AtomicUsize};

/// Starting value of the serialized size estimate.
pub const INITIAL_AVERAGE_SIZE: usize = 10_000;

/// Objects the storage engine can persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StorageObject {
    Null,
    Boolean(bool),
    Int(i64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<StorageObject>),
    Record {
        type_name: String,
        fields: Vec<StorageObject>,
    },
}

impl StorageObject {
    /// Order `other` using the natural ordering of `self`'s type, if that
    /// type can order `other` at all.
    pub fn natural_order(&self, other: &StorageObject) -> Option<Ordering> {
        match (self, other) {
            (StorageObject::Boolean(a), StorageObject::Boolean(b)) => Some(a.cmp(b)),
            (StorageObject::Int(a), StorageObject::Int(b)) => Some(a.cmp(b)),
            (StorageObject::Double(a), StorageObject::Double(b)) => Some(a.total_cmp(b)),
            (StorageObject::Text(a), StorageObject::Text(b)) => Some(a.cmp(b)),
            (StorageObject::Bytes(a), StorageObject::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// A codec for one family of storage objects.
pub trait StorageDataType: Send + Sync {
    fn type_tag(&self) -> TypeTag;

    /// Whether this codec encodes `obj`.
    fn accepts(&self, obj: &StorageObject) -> bool;

    fn compare(&self, a: &StorageObject, b: &StorageObject) -> StorageResult<Ordering>;

    /// Estimated in-memory size of `obj`.
    fn memory(&self, obj: &StorageObject) -> usize;

    /// Write `obj` including its type tag.
    fn write(&self, buf: &mut BytesMut, obj: &StorageObject) -> StorageResult<()>;

    /// Read an object whose type tag has already been consumed.
    fn read(&self, buf: &mut dyn Buf, tag: TypeTag) -> StorageResult<StorageObject>;

    /// Write a typed engine value directly.
    fn write_value(&self, _buf: &mut BytesMut, value: &Value) -> StorageResult<()> {
        Err(StorageError::Internal(format!(
            "{:?} codec cannot write {:?}",
            self.type_tag(),
            value
        )))
    }
}

fn mismatch(tag: TypeTag, obj: &StorageObject) -> StorageError {
    StorageError::Internal(format!("{:?} codec cannot encode {:?}", tag, obj))
}

fn ensure_remaining(buf: &dyn Buf, len: usize) -> StorageResult<()> {
    if buf.remaining() < len {
        return Err(StorageError::Corruption(format!(
            "need {} bytes, only {} remaining",
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn write_varint(buf: &mut BytesMut, mut n: u64) {
    while n >= 0x80 {
        buf.put_u8((n as u8) | 0x80);
        n >>= 7;
    }
    buf.put_u8(n as u8);
}

pub fn read_varint(buf: &mut dyn Buf) -> StorageResult<u64> {
    let mut result = 0u64;
    let mut shift = 0;
    loop {
        ensure_remaining(buf, 1)?;
        let byte = buf.get_u8();
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(StorageError::Corruption("varint overflow".into()));
        }
    }
}

fn read_length_prefixed(buf: &mut dyn Buf) -> StorageResult<Vec<u8>> {
    let len = read_varint(buf)?;
    let len = usize::try_from(len)
        .map_err(|_| StorageError::Corruption(format!("length {} too large", len)))?;
    ensure_remaining(buf, len)?;
    let mut data = vec![0u8; len];
    buf.copy_to_slice(&mut data);
    Ok(data)
}

pub struct IntType;

impl StorageDataType for IntType {
    fn type_tag(&self) -> TypeTag {
        TypeTag::Int
    }

    fn accepts(&self, obj: &StorageObject) -> bool {
        matches!(obj, StorageObject::Int(_))
    }

    fn compare(&self, a: &StorageObject, b: &StorageObject) -> StorageResult<Ordering> {
        match (a, b) {
            (StorageObject::Int(a), StorageObject::Int(b)) => Ok(a.cmp(b)),
            (StorageObject::Int(_), other) | (other, _) => Err(mismatch(self.type_tag(), other)),
        }
    }

    fn memory(&self, _obj: &StorageObject) -> usize {
        24
    }

    fn write(&self, buf: &mut BytesMut, obj: &StorageObject) -> StorageResult<()> {
        let StorageObject::Int(v) = obj else {
            return Err(mismatch(self.type_tag(), obj));
        };
        buf.put_u8(TypeTag::Int as u8);
        buf.put_i64_le(*v);
        Ok(())
    }

    fn read(&self, buf: &mut dyn Buf, _tag: TypeTag) -> StorageResult<StorageObject> {
        ensure_remaining(buf, 8)?;
        Ok(StorageObject::Int(buf.get_i64_le()))
    }

    fn write_value(&self, buf: &mut BytesMut, value: &Value) -> StorageResult<()> {
        match value {
            Value::Int(v) => self.write(buf, &StorageObject::Int(*v)),
            _ => Err(StorageError::Internal(format!(
                "Int codec cannot write {:?}",
                value
            ))),
        }
    }
}

pub struct TextType;

impl StorageDataType for TextType {
    fn type_tag(&self) -> TypeTag {
        TypeTag::Text
    }

    fn accepts(&self, obj: &StorageObject) -> bool {
        matches!(obj, StorageObject::Text(_))
    }

    fn compare(&self, a: &StorageObject, b: &StorageObject) -> StorageResult<Ordering> {
        match (a, b) {
            (StorageObject::Text(a), StorageObject::Text(b)) => Ok(a.cmp(b)),
            (StorageObject::Text(_), other) | (other, _) => Err(mismatch(self.type_tag(), other)),
        }
    }

    fn memory(&self, obj: &StorageObject) -> usize {
        match obj {
            StorageObject::Text(s) => 24 + 2 * s.len(),
            _ => 24,
        }
    }

    fn write(&self, buf: &mut BytesMut, obj: &StorageObject) -> StorageResult<()> {
        let StorageObject::Text(s) = obj else {
            return Err(mismatch(self.type_tag(), obj));
        };
        buf.put_u8(TypeTag::Text as u8);
        write_varint(buf, s.len() as u64);
        buf.put_slice(s.as_bytes());
        Ok(())
    }

    fn read(&self, buf: &mut dyn Buf, _tag: TypeTag) -> StorageResult<StorageObject> {
        let data = read_length_prefixed(buf)?;
        let s = String::from_utf8(data)
            .map_err(|e| StorageError::Corruption(format!("invalid text: {}", e)))?;
        Ok(StorageObject::Text(s))
    }

    fn write_value(&self, buf: &mut BytesMut, value: &Value) -> StorageResult<()> {
        match value {
            Value::String(s) => self.write(buf, &StorageObject::Text(s.clone())),
            _ => Err(StorageError::Internal(format!(
                "Text codec cannot write {:?}",
                value
            ))),
        }
    }
}

pub struct BytesType;

impl StorageDataType for BytesType {
    fn type_tag(&self) -> TypeTag {
        TypeTag::Bytes
    }

    fn accepts(&self, obj: &StorageObject) -> bool {
        matches!(obj, StorageObject::Bytes(_))
    }

    fn compare(&self, a: &StorageObject, b: &StorageObject) -> StorageResult<Ordering> {
        match (a, b) {
            (StorageObject::Bytes(a), StorageObject::Bytes(b)) => Ok(a.cmp(b)),
            (StorageObject::Bytes(_), other) | (other, _) => Err(mismatch(self.type_tag(), other)),
        }
    }

    fn memory(&self, obj: &StorageObject) -> usize {
        match obj {
            StorageObject::Bytes(b) => 24 + b.len(),
            _ => 24,
        }
    }

    fn write(&self, buf: &mut BytesMut, obj: &StorageObject) -> StorageResult<()> {
        let StorageObject::Bytes(data) = obj else {
            return Err(mismatch(self.type_tag(), obj));
        };
        buf.put_u8(TypeTag::Bytes as u8);
        write_varint(buf, data.len() as u64);
        buf.put_slice(data);
        Ok(())
    }

    fn read(&self, buf: &mut dyn Buf, _tag: TypeTag) -> StorageResult<StorageObject> {
        Ok(StorageObject::Bytes(read_length_prefixed(buf)?))
    }
}

/// Fallback codec for objects without a specialized encoding.
pub struct SerializedObjectType {
    average_size: AtomicUsize,
    types: Vec<Box<dyn StorageDataType>>,
}

impl SerializedObjectType {
    /// Codec consulting the built-in specialized types before falling back.
    pub fn new() -> Self {
        Self::with_types(vec![
            Box::new(IntType),
            Box::new(TextType),
            Box::new(BytesType),
        ])
    }

    /// Codec consulting `types` in order before falling back.
    pub fn with_types(types: Vec<Box<dyn StorageDataType>>) -> Self {
        Self {
            average_size: AtomicUsize::new(INITIAL_AVERAGE_SIZE),
            types,
        }
    }

    /// Current smoothed estimate of a serialized object's size.
    pub fn average_size(&self) -> usize {
        self.average_size.load(atomic::Ordering::Relaxed)
    }

    fn specialized(&self, obj: &StorageObject) -> Option<&dyn StorageDataType> {
        self.types
            .iter()
            .find(|t| t.accepts(obj))
            .map(|t| t.as_ref())
    }

    fn specialized_for_tag(&self, tag: TypeTag) -> Option<&dyn StorageDataType> {
        self.types
            .iter()
            .find(|t| t.type_tag() == tag)
            .map(|t| t.as_ref())
    }

    /// Read any object written by [`StorageDataType::write`] on this codec.
    pub fn read_object(&self, buf: &mut dyn Buf) -> StorageResult<StorageObject> {
        ensure_remaining(buf, 1)?;
        let tag = TypeTag::from_u8(buf.get_u8())?;
        self.read(buf, tag)
    }
}

impl Default for SerializedObjectType {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageDataType for SerializedObjectType {
    fn type_tag(&self) -> TypeTag {
        TypeTag::SerializedObject
    }

    fn accepts(&self, _obj: &StorageObject) -> bool {
        true
    }

    fn compare(&self, a: &StorageObject, b: &StorageObject) -> StorageResult<Ordering> {
        if std::ptr::eq(a, b) {
            return Ok(Ordering::Equal);
        }
        if let (Some(ta), Some(tb)) = (self.specialized(a), self.specialized(b)) {
            if ta.type_tag() == tb.type_tag() {
                return ta.compare(a, b);
            }
        }
        if let Some(order) = a.natural_order(b) {
            return Ok(order);
        }
        if let Some(order) = b.natural_order(a) {
            return Ok(order.reverse());
        }
        Ok(serialize(a)?.cmp(&serialize(b)?))
    }

    fn memory(&self, obj: &StorageObject) -> usize {
        match self.specialized(obj) {
            Some(t) => t.memory(obj),
            None => self.average_size(),
        }
    }

    fn write(&self, buf: &mut BytesMut, obj: &StorageObject) -> StorageResult<()> {
        if let Some(t) = self.specialized(obj) {
            return t.write(buf, obj);
        }

        let data = serialize(obj)?;
        // serialized objects take noticeably more room on disk than in the buffer
        let size = data.len().saturating_mul(2);
        let average = self.average_size();
        self.average_size.store(
            size.saturating_add(15 * average) / 16,
            atomic::Ordering::Relaxed,
        );

        buf.put_u8(TypeTag::SerializedObject as u8);
        write_varint(buf, data.len() as u64);
        buf.put_slice(&data);
        Ok(())
    }

    fn read(&self, buf: &mut dyn Buf, tag: TypeTag) -> StorageResult<StorageObject> {
        if tag != TypeTag::SerializedObject {
            return match self.specialized_for_tag(tag) {
                Some(t) => t.read(buf, tag),
                None => Err(StorageError::Corruption(format!(
                    "no codec registered for {:?}",
                    tag
                ))),
            };
        }
        let data = read_length_prefixed(buf)?;
        deserialize(&data)
    }

    fn write_value(&self, _buf: &mut BytesMut, value: &Value) -> StorageResult<()> {
        Err(StorageError::Internal(format!(
            "serialized object codec only writes through dispatch, got {:?}",
            value
        )))
    }
}

fn serialize(obj: &StorageObject) -> StorageResult<Vec<u8>> {
    bincode::serialize(obj).map_err(|e| StorageError::Serialization {
        object: format!("{:?}", obj),
        reason: e.to_string(),
    })
}

fn deserialize(data: &[u8]) -> StorageResult<StorageObject> {
    bincode::deserialize(data)
        .map_err(|e| StorageError::Corruption(format!("could not deserialize object: {}", e)))
}
