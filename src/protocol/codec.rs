//! Binary encoding of individual commands.
//!
//! A self-described command is its `i32` code followed by its payload. The
//! payload layout is fixed per variant: plain fields in declaration order,
//! optional fields behind a presence byte, lists behind an element count.
//! Keys and records go through the [`DataCodec`]s of the target table.
use bytes::{BufMut, BytesMut};

use crate::{
    data::{Data, DataCodec, DataType},
    descriptor::Descriptor,
    protocol::{
        command::{Command, CommandCode, Row},
        wire::{self, CodecError},
    },
};

/// Encodes and decodes commands for one target.
#[derive(Debug, Clone, Default)]
pub struct CommandCodec {
    key: DataCodec,
    record: DataCodec,
}

impl CommandCodec {
    pub fn new(key: DataCodec, record: DataCodec) -> Self {
        Self { key, record }
    }

    /// Codec for engine-level messages, which carry no keys or records.
    pub fn untyped() -> Self {
        Self::default()
    }

    pub fn for_descriptor(descriptor: &Descriptor) -> Self {
        Self::new(descriptor.key_codec(), descriptor.record_codec())
    }

    pub fn write(&self, buf: &mut BytesMut, command: &Command) -> Result<(), CodecError> {
        buf.put_i32_le(command.code() as i32);
        self.write_payload(buf, command)
    }

    pub fn read(&self, buf: &mut &[u8]) -> Result<Command, CodecError> {
        let code = CommandCode::try_from(wire::get_i32(buf)?)?;
        self.read_payload(code, buf)
    }

    pub fn write_payload(&self, buf: &mut BytesMut, command: &Command) -> Result<(), CodecError> {
        match command {
            Command::Replace { key, record } | Command::InsertOrIgnore { key, record } => {
                self.key.encode(buf, key)?;
                self.record.encode(buf, record)?;
            }
            Command::Delete { key } => self.key.encode(buf, key)?,
            Command::DeleteRange { from, to } => {
                self.key.encode(buf, from)?;
                self.key.encode(buf, to)?;
            }
            Command::Clear => {}
            Command::TryGet { key, record } => {
                self.key.encode(buf, key)?;
                self.put_opt(buf, &self.record, record.as_ref())?;
            }
            Command::Forward {
                page_count,
                from,
                to,
                rows,
            }
            | Command::Backward {
                page_count,
                from,
                to,
                rows,
            } => {
                buf.put_i32_le(*page_count);
                self.put_opt(buf, &self.key, from.as_ref())?;
                self.put_opt(buf, &self.key, to.as_ref())?;
                wire::put_bool(buf, rows.is_some());
                if let Some(rows) = rows {
                    buf.put_i32_le(wire::count_i32(rows.len(), "row")?);
                    for row in rows {
                        self.put_row(buf, row)?;
                    }
                }
            }
            Command::FindNext { key, row }
            | Command::FindAfter { key, row }
            | Command::FindPrev { key, row }
            | Command::FindBefore { key, row } => {
                self.key.encode(buf, key)?;
                self.put_opt_row(buf, row.as_ref())?;
            }
            Command::FirstRow { row } | Command::LastRow { row } => {
                self.put_opt_row(buf, row.as_ref())?;
            }
            Command::Count { count } => buf.put_i64_le(*count),
            Command::DescriptorGet { descriptor } | Command::DescriptorSet { descriptor } => {
                put_opt_descriptor(buf, descriptor.as_ref());
            }

            Command::Commit => {}
            Command::Enumerate { descriptors } => {
                wire::put_bool(buf, descriptors.is_some());
                if let Some(descriptors) = descriptors {
                    wire::put_varint(buf, descriptors.len() as u64);
                    for descriptor in descriptors {
                        descriptor.encode(buf);
                    }
                }
            }
            Command::Rename { name, new_name } => {
                wire::put_string(buf, name);
                wire::put_string(buf, new_name);
            }
            Command::Exists { name, exists } => {
                wire::put_string(buf, name);
                wire::put_bool(buf, *exists);
            }
            Command::FindById { id, descriptor } => {
                buf.put_i64_le(*id);
                put_opt_descriptor(buf, descriptor.as_ref());
            }
            Command::FindByName { name, descriptor } => {
                wire::put_string(buf, name);
                put_opt_descriptor(buf, descriptor.as_ref());
            }
            Command::OpenTable {
                name,
                key_type,
                record_type,
                descriptor,
            } => {
                wire::put_string(buf, name);
                key_type.encode(buf);
                record_type.encode(buf);
                put_opt_descriptor(buf, descriptor.as_ref());
            }
            Command::OpenFile { name, id } => {
                wire::put_string(buf, name);
                buf.put_i64_le(*id);
            }
            Command::DeleteTable { name } => wire::put_string(buf, name),
            Command::CountTables { count } => wire::put_varint(buf, *count),
            Command::GetCacheSize { cache_size } | Command::SetCacheSize { cache_size } => {
                buf.put_i32_le(*cache_size);
            }

            Command::ObtainHandle { handle } | Command::ReleaseHandle { handle } => {
                buf.put_i64_le(*handle);
            }
            Command::HandleExists { handle, exists } => {
                buf.put_i64_le(*handle);
                wire::put_bool(buf, *exists);
            }
            Command::HeapWrite {
                handle,
                buffer,
                index,
                count,
            } => {
                buf.put_i64_le(*handle);
                buf.put_i32_le(*index);
                buf.put_i32_le(*count);
                wire::put_opt_bytes(buf, buffer.as_deref());
            }
            Command::HeapRead { handle, buffer } => {
                buf.put_i64_le(*handle);
                wire::put_opt_bytes(buf, buffer.as_deref());
            }
            Command::HeapCommit | Command::HeapClose => {}
            Command::HeapSetTag { tag } | Command::HeapGetTag { tag } => {
                wire::put_opt_bytes(buf, tag.as_deref());
            }
            Command::HeapDataSize { size } | Command::HeapSize { size } => buf.put_i64_le(*size),

            Command::Exception { message } => wire::put_string(buf, message),
        }
        Ok(())
    }

    pub fn read_payload(&self, code: CommandCode, buf: &mut &[u8]) -> Result<Command, CodecError> {
        let command = match code {
            CommandCode::Undefined => return Err(CodecError::UnknownCommand(code as i32)),

            CommandCode::Replace => Command::Replace {
                key: self.key.decode(buf)?,
                record: self.record.decode(buf)?,
            },
            CommandCode::Delete => Command::Delete {
                key: self.key.decode(buf)?,
            },
            CommandCode::DeleteRange => Command::DeleteRange {
                from: self.key.decode(buf)?,
                to: self.key.decode(buf)?,
            },
            CommandCode::InsertOrIgnore => Command::InsertOrIgnore {
                key: self.key.decode(buf)?,
                record: self.record.decode(buf)?,
            },
            CommandCode::Clear => Command::Clear,
            CommandCode::TryGet => Command::TryGet {
                key: self.key.decode(buf)?,
                record: self.get_opt(buf, &self.record)?,
            },
            CommandCode::Forward | CommandCode::Backward => {
                let page_count = wire::get_i32(buf)?;
                let from = self.get_opt(buf, &self.key)?;
                let to = self.get_opt(buf, &self.key)?;
                let rows = if wire::get_bool(buf)? {
                    let count = wire::get_count(buf, "row")?;
                    let mut rows = Vec::with_capacity(count.min(buf.len()));
                    for _ in 0..count {
                        rows.push(self.get_row(buf)?);
                    }
                    Some(rows)
                } else {
                    None
                };
                if code == CommandCode::Forward {
                    Command::Forward {
                        page_count,
                        from,
                        to,
                        rows,
                    }
                } else {
                    Command::Backward {
                        page_count,
                        from,
                        to,
                        rows,
                    }
                }
            }
            CommandCode::FindNext => Command::FindNext {
                key: self.key.decode(buf)?,
                row: self.get_opt_row(buf)?,
            },
            CommandCode::FindAfter => Command::FindAfter {
                key: self.key.decode(buf)?,
                row: self.get_opt_row(buf)?,
            },
            CommandCode::FindPrev => Command::FindPrev {
                key: self.key.decode(buf)?,
                row: self.get_opt_row(buf)?,
            },
            CommandCode::FindBefore => Command::FindBefore {
                key: self.key.decode(buf)?,
                row: self.get_opt_row(buf)?,
            },
            CommandCode::FirstRow => Command::FirstRow {
                row: self.get_opt_row(buf)?,
            },
            CommandCode::LastRow => Command::LastRow {
                row: self.get_opt_row(buf)?,
            },
            CommandCode::Count => Command::Count {
                count: wire::get_i64(buf)?,
            },
            CommandCode::DescriptorGet => Command::DescriptorGet {
                descriptor: get_opt_descriptor(buf)?,
            },
            CommandCode::DescriptorSet => Command::DescriptorSet {
                descriptor: get_opt_descriptor(buf)?,
            },

            CommandCode::Commit => Command::Commit,
            CommandCode::Enumerate => {
                let descriptors = if wire::get_bool(buf)? {
                    let count = wire::get_varint(buf)? as usize;
                    let mut descriptors = Vec::with_capacity(count.min(buf.len()));
                    for _ in 0..count {
                        descriptors.push(Descriptor::decode(buf)?);
                    }
                    Some(descriptors)
                } else {
                    None
                };
                Command::Enumerate { descriptors }
            }
            CommandCode::Rename => Command::Rename {
                name: wire::get_string(buf)?,
                new_name: wire::get_string(buf)?,
            },
            CommandCode::Exists => Command::Exists {
                name: wire::get_string(buf)?,
                exists: wire::get_bool(buf)?,
            },
            CommandCode::FindById => Command::FindById {
                id: wire::get_i64(buf)?,
                descriptor: get_opt_descriptor(buf)?,
            },
            CommandCode::FindByName => Command::FindByName {
                name: wire::get_string(buf)?,
                descriptor: get_opt_descriptor(buf)?,
            },
            CommandCode::OpenTable => Command::OpenTable {
                name: wire::get_string(buf)?,
                key_type: DataType::decode(buf)?,
                record_type: DataType::decode(buf)?,
                descriptor: get_opt_descriptor(buf)?,
            },
            CommandCode::OpenFile => Command::OpenFile {
                name: wire::get_string(buf)?,
                id: wire::get_i64(buf)?,
            },
            CommandCode::DeleteTable => Command::DeleteTable {
                name: wire::get_string(buf)?,
            },
            CommandCode::CountTables => Command::CountTables {
                count: wire::get_varint(buf)?,
            },
            CommandCode::GetCacheSize => Command::GetCacheSize {
                cache_size: wire::get_i32(buf)?,
            },
            CommandCode::SetCacheSize => Command::SetCacheSize {
                cache_size: wire::get_i32(buf)?,
            },

            CommandCode::ObtainHandle => Command::ObtainHandle {
                handle: wire::get_i64(buf)?,
            },
            CommandCode::ReleaseHandle => Command::ReleaseHandle {
                handle: wire::get_i64(buf)?,
            },
            CommandCode::HandleExists => Command::HandleExists {
                handle: wire::get_i64(buf)?,
                exists: wire::get_bool(buf)?,
            },
            CommandCode::HeapWrite => Command::HeapWrite {
                handle: wire::get_i64(buf)?,
                index: wire::get_i32(buf)?,
                count: wire::get_i32(buf)?,
                buffer: wire::get_opt_bytes(buf)?,
            },
            CommandCode::HeapRead => Command::HeapRead {
                handle: wire::get_i64(buf)?,
                buffer: wire::get_opt_bytes(buf)?,
            },
            CommandCode::HeapCommit => Command::HeapCommit,
            CommandCode::HeapClose => Command::HeapClose,
            CommandCode::HeapSetTag => Command::HeapSetTag {
                tag: wire::get_opt_bytes(buf)?,
            },
            CommandCode::HeapGetTag => Command::HeapGetTag {
                tag: wire::get_opt_bytes(buf)?,
            },
            CommandCode::HeapDataSize => Command::HeapDataSize {
                size: wire::get_i64(buf)?,
            },
            CommandCode::HeapSize => Command::HeapSize {
                size: wire::get_i64(buf)?,
            },

            CommandCode::Exception => Command::Exception {
                message: wire::get_string(buf)?,
            },
        };
        Ok(command)
    }

    fn put_opt(
        &self,
        buf: &mut BytesMut,
        codec: &DataCodec,
        value: Option<&Data>,
    ) -> Result<(), CodecError> {
        wire::put_bool(buf, value.is_some());
        if let Some(value) = value {
            codec.encode(buf, value)?;
        }
        Ok(())
    }

    fn get_opt(&self, buf: &mut &[u8], codec: &DataCodec) -> Result<Option<Data>, CodecError> {
        if wire::get_bool(buf)? {
            Ok(Some(codec.decode(buf)?))
        } else {
            Ok(None)
        }
    }

    /// Encoded size of one row in a page.
    pub fn row_len(&self, row: &Row, scratch: &mut BytesMut) -> Result<usize, CodecError> {
        scratch.clear();
        self.put_row(scratch, row)?;
        Ok(scratch.len())
    }

    /// Encoded size of one self-described command.
    pub fn command_len(&self, command: &Command, scratch: &mut BytesMut) -> Result<usize, CodecError> {
        scratch.clear();
        self.write(scratch, command)?;
        Ok(scratch.len())
    }

    fn put_row(&self, buf: &mut BytesMut, (key, record): &Row) -> Result<(), CodecError> {
        self.key.encode(buf, key)?;
        self.record.encode(buf, record)
    }

    fn get_row(&self, buf: &mut &[u8]) -> Result<Row, CodecError> {
        Ok((self.key.decode(buf)?, self.record.decode(buf)?))
    }

    fn put_opt_row(&self, buf: &mut BytesMut, row: Option<&Row>) -> Result<(), CodecError> {
        wire::put_bool(buf, row.is_some());
        if let Some(row) = row {
            self.put_row(buf, row)?;
        }
        Ok(())
    }

    fn get_opt_row(&self, buf: &mut &[u8]) -> Result<Option<Row>, CodecError> {
        if wire::get_bool(buf)? {
            Ok(Some(self.get_row(buf)?))
        } else {
            Ok(None)
        }
    }
}

fn put_opt_descriptor(buf: &mut BytesMut, descriptor: Option<&Descriptor>) {
    wire::put_bool(buf, descriptor.is_some());
    if let Some(descriptor) = descriptor {
        descriptor.encode(buf);
    }
}

fn get_opt_descriptor(buf: &mut &[u8]) -> Result<Option<Descriptor>, CodecError> {
    if wire::get_bool(buf)? {
        Ok(Some(Descriptor::decode(buf)?))
    } else {
        Ok(None)
    }
}
