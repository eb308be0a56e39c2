//! Typed key and record values.
//!
//! Every remote table declares a [`DataType`] for its keys and one for its
//! records. Values travel as [`Data`] and are (de)serialized by a [`DataCodec`]
//! built from the descriptor, so the protocol layer never needs to know more
//! than "encode or decode one value of this type".
use std::{cmp::Ordering, fmt, str::FromStr};

use bincode::{Decode, Encode};
use bytes::{BufMut, BytesMut};

use crate::protocol::wire::{self, CodecError};

const TAG_BOOL: u8 = 1;
const TAG_INT32: u8 = 2;
const TAG_INT64: u8 = 3;
const TAG_UINT64: u8 = 4;
const TAG_FLOAT64: u8 = 5;
const TAG_STRING: u8 = 6;
const TAG_BYTES: u8 = 7;
const TAG_SLOTS: u8 = 8;

/// Deepest `Slots` nesting accepted from the wire.
pub const MAX_TYPE_DEPTH: usize = 32;

/// Type of a key or record column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub enum DataType {
    Bool,
    Int32,
    Int64,
    UInt64,
    Float64,
    String,
    Bytes,
    /// Fixed sequence of slot types, compared lexicographically.
    Slots(Vec<DataType>),
}

impl DataType {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            DataType::Bool => buf.put_u8(TAG_BOOL),
            DataType::Int32 => buf.put_u8(TAG_INT32),
            DataType::Int64 => buf.put_u8(TAG_INT64),
            DataType::UInt64 => buf.put_u8(TAG_UINT64),
            DataType::Float64 => buf.put_u8(TAG_FLOAT64),
            DataType::String => buf.put_u8(TAG_STRING),
            DataType::Bytes => buf.put_u8(TAG_BYTES),
            DataType::Slots(slots) => {
                buf.put_u8(TAG_SLOTS);
                wire::put_varint(buf, slots.len() as u64);
                for slot in slots {
                    slot.encode(buf);
                }
            }
        }
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self, CodecError> {
        Self::decode_nested(buf, 0)
    }

    fn decode_nested(buf: &mut &[u8], depth: usize) -> Result<Self, CodecError> {
        Ok(match wire::get_u8(buf)? {
            TAG_BOOL => DataType::Bool,
            TAG_INT32 => DataType::Int32,
            TAG_INT64 => DataType::Int64,
            TAG_UINT64 => DataType::UInt64,
            TAG_FLOAT64 => DataType::Float64,
            TAG_STRING => DataType::String,
            TAG_BYTES => DataType::Bytes,
            TAG_SLOTS => {
                if depth >= MAX_TYPE_DEPTH {
                    return Err(CodecError::TypeTooDeep(MAX_TYPE_DEPTH));
                }
                let count = wire::get_varint(buf)? as usize;
                let mut slots = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    slots.push(DataType::decode_nested(buf, depth + 1)?);
                }
                DataType::Slots(slots)
            }
            tag => return Err(CodecError::UnknownDataType(tag)),
        })
    }

    /// Whether `value` is an instance of this type.
    pub fn admits(&self, value: &Data) -> bool {
        match (self, value) {
            (DataType::Bool, Data::Bool(_))
            | (DataType::Int32, Data::Int32(_))
            | (DataType::Int64, Data::Int64(_))
            | (DataType::UInt64, Data::UInt64(_))
            | (DataType::Float64, Data::Float64(_))
            | (DataType::String, Data::String(_))
            | (DataType::Bytes, Data::Bytes(_)) => true,
            (DataType::Slots(types), Data::Slots(values)) => {
                types.len() == values.len()
                    && types.iter().zip(values).all(|(t, v)| t.admits(v))
            }
            _ => false,
        }
    }

    /// Parses a scalar value written as text, e.g. on the command line.
    pub fn parse_value(&self, s: &str) -> Result<Data, String> {
        let invalid = |e: &dyn fmt::Display| format!("'{s}' is not a valid {self}: {e}");
        match self {
            DataType::Bool => s.parse().map(Data::Bool).map_err(|e| invalid(&e)),
            DataType::Int32 => s.parse().map(Data::Int32).map_err(|e| invalid(&e)),
            DataType::Int64 => s.parse().map(Data::Int64).map_err(|e| invalid(&e)),
            DataType::UInt64 => s.parse().map(Data::UInt64).map_err(|e| invalid(&e)),
            DataType::Float64 => s.parse().map(Data::Float64).map_err(|e| invalid(&e)),
            DataType::String => Ok(Data::String(s.to_string())),
            DataType::Bytes => Ok(Data::Bytes(s.as_bytes().to_vec())),
            DataType::Slots(_) => Err(format!("cannot parse {self} from text")),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bool => write!(f, "bool"),
            DataType::Int32 => write!(f, "int32"),
            DataType::Int64 => write!(f, "int64"),
            DataType::UInt64 => write!(f, "uint64"),
            DataType::Float64 => write!(f, "float64"),
            DataType::String => write!(f, "string"),
            DataType::Bytes => write!(f, "bytes"),
            DataType::Slots(slots) => {
                write!(f, "(")?;
                for (i, slot) in slots.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{slot}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bool" => Ok(DataType::Bool),
            "int32" | "i32" => Ok(DataType::Int32),
            "int64" | "i64" => Ok(DataType::Int64),
            "uint64" | "u64" => Ok(DataType::UInt64),
            "float64" | "f64" => Ok(DataType::Float64),
            "string" | "str" => Ok(DataType::String),
            "bytes" => Ok(DataType::Bytes),
            other => Err(format!("unknown data type '{other}'")),
        }
    }
}

/// A key or record value.
#[derive(Debug, Clone, Encode, Decode)]
pub enum Data {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Slots(Vec<Data>),
}

impl Data {
    fn rank(&self) -> u8 {
        match self {
            Data::Bool(_) => TAG_BOOL,
            Data::Int32(_) => TAG_INT32,
            Data::Int64(_) => TAG_INT64,
            Data::UInt64(_) => TAG_UINT64,
            Data::Float64(_) => TAG_FLOAT64,
            Data::String(_) => TAG_STRING,
            Data::Bytes(_) => TAG_BYTES,
            Data::Slots(_) => TAG_SLOTS,
        }
    }
}

impl Ord for Data {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Data::Bool(a), Data::Bool(b)) => a.cmp(b),
            (Data::Int32(a), Data::Int32(b)) => a.cmp(b),
            (Data::Int64(a), Data::Int64(b)) => a.cmp(b),
            (Data::UInt64(a), Data::UInt64(b)) => a.cmp(b),
            (Data::Float64(a), Data::Float64(b)) => a.total_cmp(b),
            (Data::String(a), Data::String(b)) => a.cmp(b),
            (Data::Bytes(a), Data::Bytes(b)) => a.cmp(b),
            (Data::Slots(a), Data::Slots(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for Data {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Data {}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Data::Bool(v) => write!(f, "{v}"),
            Data::Int32(v) => write!(f, "{v}"),
            Data::Int64(v) => write!(f, "{v}"),
            Data::UInt64(v) => write!(f, "{v}"),
            Data::Float64(v) => write!(f, "{v}"),
            Data::String(v) => write!(f, "{v:?}"),
            Data::Bytes(v) => match std::str::from_utf8(v) {
                Ok(s) => write!(f, "b{s:?}"),
                Err(_) => write!(f, "{v:02x?}"),
            },
            Data::Slots(slots) => {
                write!(f, "(")?;
                for (i, slot) in slots.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{slot}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<bool> for Data {
    fn from(value: bool) -> Self {
        Data::Bool(value)
    }
}

impl From<i32> for Data {
    fn from(value: i32) -> Self {
        Data::Int32(value)
    }
}

impl From<i64> for Data {
    fn from(value: i64) -> Self {
        Data::Int64(value)
    }
}

impl From<u64> for Data {
    fn from(value: u64) -> Self {
        Data::UInt64(value)
    }
}

impl From<f64> for Data {
    fn from(value: f64) -> Self {
        Data::Float64(value)
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::String(value.to_string())
    }
}

impl From<String> for Data {
    fn from(value: String) -> Self {
        Data::String(value)
    }
}

impl From<Vec<u8>> for Data {
    fn from(value: Vec<u8>) -> Self {
        Data::Bytes(value)
    }
}

/// Encodes and decodes values of one declared [`DataType`].
///
/// An untyped codec is used for engine-level messages, which never carry keys
/// or records; it rejects every value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataCodec {
    data_type: Option<DataType>,
}

impl DataCodec {
    pub fn typed(data_type: DataType) -> Self {
        Self {
            data_type: Some(data_type),
        }
    }

    pub fn untyped() -> Self {
        Self::default()
    }

    pub fn data_type(&self) -> Option<&DataType> {
        self.data_type.as_ref()
    }

    pub fn encode(&self, buf: &mut BytesMut, value: &Data) -> Result<(), CodecError> {
        let data_type = self.data_type.as_ref().ok_or(CodecError::Untyped)?;
        encode_value(buf, data_type, value)
    }

    pub fn decode(&self, buf: &mut &[u8]) -> Result<Data, CodecError> {
        let data_type = self.data_type.as_ref().ok_or(CodecError::Untyped)?;
        decode_value(buf, data_type)
    }
}

fn encode_value(buf: &mut BytesMut, data_type: &DataType, value: &Data) -> Result<(), CodecError> {
    match (data_type, value) {
        (DataType::Bool, Data::Bool(v)) => wire::put_bool(buf, *v),
        (DataType::Int32, Data::Int32(v)) => buf.put_i32_le(*v),
        (DataType::Int64, Data::Int64(v)) => buf.put_i64_le(*v),
        (DataType::UInt64, Data::UInt64(v)) => buf.put_u64_le(*v),
        (DataType::Float64, Data::Float64(v)) => buf.put_f64_le(*v),
        (DataType::String, Data::String(v)) => wire::put_string(buf, v),
        (DataType::Bytes, Data::Bytes(v)) => wire::put_bytes(buf, v),
        (DataType::Slots(types), Data::Slots(values)) if types.len() == values.len() => {
            for (t, v) in types.iter().zip(values) {
                encode_value(buf, t, v)?;
            }
        }
        (t, _) => {
            return Err(CodecError::TypeMismatch {
                expected: t.to_string(),
            });
        }
    }
    Ok(())
}

fn decode_value(buf: &mut &[u8], data_type: &DataType) -> Result<Data, CodecError> {
    Ok(match data_type {
        DataType::Bool => Data::Bool(wire::get_bool(buf)?),
        DataType::Int32 => Data::Int32(wire::get_i32(buf)?),
        DataType::Int64 => Data::Int64(wire::get_i64(buf)?),
        DataType::UInt64 => Data::UInt64(wire::get_u64(buf)?),
        DataType::Float64 => Data::Float64(wire::get_f64(buf)?),
        DataType::String => Data::String(wire::get_string(buf)?),
        DataType::Bytes => Data::Bytes(wire::get_bytes(buf)?),
        DataType::Slots(types) => {
            let mut values = Vec::with_capacity(types.len());
            for t in types {
                values.push(decode_value(buf, t)?);
            }
            Data::Slots(values)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_order_lexicographically() {
        let a = Data::Slots(vec![Data::Int32(1), Data::String("b".into())]);
        let b = Data::Slots(vec![Data::Int32(1), Data::String("c".into())]);
        let c = Data::Slots(vec![Data::Int32(2), Data::String("a".into())]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn deeply_nested_type_is_rejected() {
        let mut nested = DataType::Int64;
        for _ in 0..MAX_TYPE_DEPTH {
            nested = DataType::Slots(vec![nested]);
        }
        let mut buf = BytesMut::new();
        nested.encode(&mut buf);
        assert_eq!(DataType::decode(&mut &buf[..]).unwrap(), nested);

        let deeper = DataType::Slots(vec![nested]);
        let mut buf = BytesMut::new();
        deeper.encode(&mut buf);
        assert_eq!(
            DataType::decode(&mut &buf[..]),
            Err(CodecError::TypeTooDeep(MAX_TYPE_DEPTH))
        );
    }

    #[test]
    fn floats_are_totally_ordered() {
        assert!(Data::Float64(-0.5) < Data::Float64(0.0));
        assert_eq!(Data::Float64(f64::NAN), Data::Float64(f64::NAN));
    }

    #[test]
    fn typed_codec_reads_back_composite_value() {
        let data_type = DataType::Slots(vec![DataType::Int64, DataType::String, DataType::Bytes]);
        let codec = DataCodec::typed(data_type);
        let value = Data::Slots(vec![
            Data::Int64(-42),
            Data::String("slot".into()),
            Data::Bytes(vec![0, 1, 2]),
        ]);

        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &value).unwrap();
        let mut slice = &buf[..];
        assert_eq!(codec.decode(&mut slice).unwrap(), value);
        assert!(slice.is_empty());
    }

    #[test]
    fn typed_codec_rejects_wrong_type() {
        let codec = DataCodec::typed(DataType::Int64);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(&mut buf, &Data::String("nope".into())),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn untyped_codec_rejects_values() {
        let codec = DataCodec::untyped();
        let mut buf = BytesMut::new();
        assert_eq!(codec.encode(&mut buf, &Data::Int32(1)), Err(CodecError::Untyped));
    }

    #[test]
    fn data_type_encoding_reads_back() {
        let data_type = DataType::Slots(vec![DataType::UInt64, DataType::Slots(vec![DataType::Bool])]);
        let mut buf = BytesMut::new();
        data_type.encode(&mut buf);
        let mut slice = &buf[..];
        assert_eq!(DataType::decode(&mut slice).unwrap(), data_type);
    }

    #[test]
    fn parse_scalar_values() {
        assert_eq!(DataType::Int64.parse_value("17").unwrap(), Data::Int64(17));
        assert_eq!("string".parse::<DataType>().unwrap(), DataType::String);
        assert!(DataType::Int32.parse_value("x").is_err());
    }
}
