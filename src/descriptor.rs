//! Structure metadata shared by the client and the server.
use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use bincode::{Decode, Encode};
use bytes::{BufMut, BytesMut};

use crate::{
    data::{DataCodec, DataType},
    protocol::wire::{self, CodecError},
};

/// Identifier reserved for engine-level messages, which have no descriptor.
pub const ENGINE_ID: i64 = -1;

/// Microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum StructureKind {
    Reserved,
    Table,
    File,
}

impl StructureKind {
    pub fn code(self) -> u64 {
        match self {
            StructureKind::Reserved => 0,
            StructureKind::Table => 1,
            StructureKind::File => 2,
        }
    }
}

impl TryFrom<u64> for StructureKind {
    type Error = CodecError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StructureKind::Reserved),
            1 => Ok(StructureKind::Table),
            2 => Ok(StructureKind::File),
            other => Err(CodecError::UnknownStructureKind(other)),
        }
    }
}

/// Identity, type and timing metadata of one engine structure.
///
/// Descriptors have value semantics: a client keeps its latest copy and
/// replaces it wholesale after every synchronization with the server.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Descriptor {
    pub id: i64,
    pub name: String,
    pub structure_kind: StructureKind,
    pub key_type: DataType,
    pub record_type: DataType,
    pub create_time: Timestamp,
    pub modified_time: Timestamp,
    pub access_time: Timestamp,
    /// Opaque client-owned bytes. `None` and an empty tag are distinct.
    pub tag: Option<Vec<u8>>,
}

impl Descriptor {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        structure_kind: StructureKind,
        key_type: DataType,
        record_type: DataType,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            name: name.into(),
            structure_kind,
            key_type,
            record_type,
            create_time: now,
            modified_time: now,
            access_time: now,
            tag: None,
        }
    }

    pub fn key_codec(&self) -> DataCodec {
        DataCodec::typed(self.key_type.clone())
    }

    pub fn record_codec(&self) -> DataCodec {
        DataCodec::typed(self.record_type.clone())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        wire::put_varint(buf, self.id as u64);
        wire::put_string(buf, &self.name);
        wire::put_varint(buf, self.structure_kind.code());
        self.key_type.encode(buf);
        self.record_type.encode(buf);
        wire::put_varint(buf, self.create_time.0);
        wire::put_varint(buf, self.modified_time.0);
        wire::put_varint(buf, self.access_time.0);
        // tag length is shifted by one so that zero means "no tag"
        match &self.tag {
            Some(tag) => {
                wire::put_varint(buf, tag.len() as u64 + 1);
                buf.put_slice(tag);
            }
            None => wire::put_varint(buf, 0),
        }
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let id = wire::get_varint(buf)? as i64;
        let name = wire::get_string(buf)?;
        let structure_kind = StructureKind::try_from(wire::get_varint(buf)?)?;
        let key_type = DataType::decode(buf)?;
        let record_type = DataType::decode(buf)?;
        let create_time = Timestamp(wire::get_varint(buf)?);
        let modified_time = Timestamp(wire::get_varint(buf)?);
        let access_time = Timestamp(wire::get_varint(buf)?);
        let tag = match wire::get_varint(buf)? {
            0 => None,
            len => Some(wire::take(buf, (len - 1) as usize, "descriptor tag")?),
        };

        Ok(Self {
            id,
            name,
            structure_kind,
            key_type,
            record_type,
            create_time,
            modified_time,
            access_time,
            tag,
        })
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} ({} -> {})",
            self.id, self.name, self.key_type, self.record_type
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Descriptor {
        Descriptor::new(7, "orders", StructureKind::Table, DataType::Int64, DataType::String)
    }

    fn reencode(descriptor: &Descriptor) -> Descriptor {
        let mut buf = BytesMut::new();
        descriptor.encode(&mut buf);
        let mut slice = &buf[..];
        let decoded = Descriptor::decode(&mut slice).unwrap();
        assert!(slice.is_empty());
        decoded
    }

    #[test]
    fn missing_and_empty_tags_stay_distinct() {
        let mut descriptor = sample();
        assert_eq!(reencode(&descriptor).tag, None);

        descriptor.tag = Some(Vec::new());
        assert_eq!(reencode(&descriptor).tag, Some(Vec::new()));

        descriptor.tag = Some(b"owner=7".to_vec());
        assert_eq!(reencode(&descriptor), descriptor);
    }

    #[test]
    fn unknown_structure_kind_is_rejected() {
        let mut buf = BytesMut::new();
        wire::put_varint(&mut buf, 1);
        wire::put_string(&mut buf, "x");
        wire::put_varint(&mut buf, 9);
        let mut slice = &buf[..];
        assert_eq!(
            Descriptor::decode(&mut slice),
            Err(CodecError::UnknownStructureKind(9))
        );
    }

    #[test]
    fn truncated_tag_is_rejected() {
        let mut descriptor = sample();
        descriptor.tag = Some(vec![1, 2, 3]);
        let mut buf = BytesMut::new();
        descriptor.encode(&mut buf);
        let short = &buf[..buf.len() - 1];
        let mut slice = short;
        assert!(matches!(
            Descriptor::decode(&mut slice),
            Err(CodecError::Truncated { .. })
        ));
    }
}
