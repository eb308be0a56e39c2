//! Ordered command batches and the common-action encoding.
use bytes::{BufMut, BytesMut};

use crate::protocol::{
    codec::CommandCodec,
    command::{Command, CommandCode},
    wire::{self, CodecError},
};

/// Commands bound for one target, in submission order.
///
/// Tracks whether every command so far shares one code. Once a differing code
/// is pushed the batch stays mixed until [`CommandBatch::clear`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBatch {
    commands: Vec<Command>,
    all_common: bool,
    common_code: CommandCode,
}

impl Default for CommandBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBatch {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            all_common: true,
            common_code: CommandCode::Undefined,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity),
            ..Self::new()
        }
    }

    pub fn push(&mut self, command: Command) {
        let code = command.code();
        if self.commands.is_empty() {
            self.common_code = code;
        } else if self.all_common && code != self.common_code {
            self.all_common = false;
            self.common_code = CommandCode::Undefined;
        }
        self.commands.push(command);
    }

    pub fn clear(&mut self) {
        self.commands.clear();
        self.all_common = true;
        self.common_code = CommandCode::Undefined;
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// True iff every command in the batch has the same code. An empty batch
    /// is trivially common.
    pub fn all_common(&self) -> bool {
        self.all_common
    }

    /// Shared code of a uniform, non-empty batch; `Undefined` otherwise.
    pub fn common_code(&self) -> CommandCode {
        if self.all_common {
            self.common_code
        } else {
            CommandCode::Undefined
        }
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn last(&self) -> Option<&Command> {
        self.commands.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.commands.iter()
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    /// Writes `count`, `common_code`, then the commands. Uniform batches of
    /// more than one bulk mutation omit the per-command code.
    pub fn encode(&self, buf: &mut BytesMut, codec: &CommandCodec) -> Result<(), CodecError> {
        let common = self.common_code();
        buf.put_i32_le(wire::count_i32(self.commands.len(), "command")?);
        buf.put_i32_le(common as i32);

        if compact(self.commands.len(), common) {
            for command in &self.commands {
                codec.write_payload(buf, command)?;
            }
        } else {
            for command in &self.commands {
                codec.write(buf, command)?;
            }
        }
        Ok(())
    }

    pub fn decode(buf: &mut &[u8], codec: &CommandCodec) -> Result<Self, CodecError> {
        let count = wire::get_count(buf, "command")?;
        let common = CommandCode::try_from(wire::get_i32(buf)?)?;

        let mut batch = CommandBatch::with_capacity(count.min(buf.len()));
        if compact(count, common) {
            for _ in 0..count {
                batch.push(codec.read_payload(common, buf)?);
            }
        } else {
            for _ in 0..count {
                batch.push(codec.read(buf)?);
            }
        }
        Ok(batch)
    }
}

fn compact(count: usize, common: CommandCode) -> bool {
    count > 1 && common.is_bulk_mutation()
}

impl From<Command> for CommandBatch {
    fn from(command: Command) -> Self {
        let mut batch = CommandBatch::new();
        batch.push(command);
        batch
    }
}

impl FromIterator<Command> for CommandBatch {
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        let mut batch = CommandBatch::new();
        for command in iter {
            batch.push(command);
        }
        batch
    }
}

impl IntoIterator for CommandBatch {
    type Item = Command;
    type IntoIter = std::vec::IntoIter<Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::Data, protocol::codec::tests::{codec, every_command}};

    fn encoded(batch: &CommandBatch) -> Vec<u8> {
        let mut buf = BytesMut::new();
        batch.encode(&mut buf, &codec()).unwrap();
        buf.to_vec()
    }

    fn decoded(bytes: &[u8]) -> CommandBatch {
        let mut slice = bytes;
        let batch = CommandBatch::decode(&mut slice, &codec()).unwrap();
        assert!(slice.is_empty());
        batch
    }

    fn deletes(n: i64) -> CommandBatch {
        (0..n).map(|k| Command::Delete { key: Data::Int64(k) }).collect()
    }

    #[test]
    fn common_flag_tracks_codes() {
        let mut batch = CommandBatch::new();
        assert!(batch.all_common());
        assert_eq!(batch.common_code(), CommandCode::Undefined);

        for k in 0..3 {
            batch.push(Command::Delete { key: Data::Int64(k) });
        }
        assert!(batch.all_common());
        assert_eq!(batch.common_code(), CommandCode::Delete);

        batch.push(Command::Clear);
        assert!(!batch.all_common());
        assert_eq!(batch.common_code(), CommandCode::Undefined);

        // stays mixed even when later codes match the first one again
        batch.push(Command::Delete { key: Data::Int64(9) });
        assert!(!batch.all_common());

        batch.clear();
        assert!(batch.is_empty());
        assert!(batch.all_common());
        batch.push(Command::Clear);
        assert_eq!(batch.common_code(), CommandCode::Clear);
    }

    #[test]
    fn uniform_deletes_omit_codes() {
        let batch = deletes(5);
        let bytes = encoded(&batch);

        // header plus five bare int64 keys
        assert_eq!(bytes.len(), 8 + 5 * 8);
        assert_eq!(&bytes[4..8], &(CommandCode::Delete as i32).to_le_bytes());
        assert_eq!(decoded(&bytes), batch);
    }

    #[test]
    fn uniform_reads_keep_codes() {
        let batch: CommandBatch = (0..5)
            .map(|k| Command::TryGet {
                key: Data::Int64(k),
                record: None,
            })
            .collect();
        assert_eq!(batch.common_code(), CommandCode::TryGet);

        let bytes = encoded(&batch);
        // header plus five (code, key, presence byte)
        assert_eq!(bytes.len(), 8 + 5 * (4 + 8 + 1));
        assert_eq!(&bytes[8..12], &(CommandCode::TryGet as i32).to_le_bytes());
        assert_eq!(decoded(&bytes), batch);
    }

    #[test]
    fn single_bulk_mutation_is_self_described() {
        let batch = deletes(1);
        let bytes = encoded(&batch);
        assert_eq!(bytes.len(), 8 + 4 + 8);
        assert_eq!(decoded(&bytes), batch);
    }

    #[test]
    fn empty_batch() {
        let bytes = encoded(&CommandBatch::new());
        assert_eq!(bytes, vec![0; 8]);
        assert!(decoded(&bytes).is_empty());

        // the common code of an empty batch is irrelevant
        let mut buf = BytesMut::new();
        buf.put_i32_le(0);
        buf.put_i32_le(CommandCode::Replace as i32);
        assert!(decoded(&buf).is_empty());
    }

    #[test]
    fn mixed_batch_reads_back() {
        let batch: CommandBatch = every_command(true).into_iter().collect();
        assert!(!batch.all_common());
        assert_eq!(decoded(&encoded(&batch)), batch);
    }

    #[test]
    fn negative_count_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(-3);
        buf.put_i32_le(0);
        let mut slice = &buf[..];
        assert!(matches!(
            CommandBatch::decode(&mut slice, &codec()),
            Err(CodecError::NegativeCount { count: -3, .. })
        ));
    }
}
