//! Request and response envelopes.
//!
//! A [`Message`] is one descriptor reference followed by one command batch.
//! Only the descriptor id travels on the wire; the reader resolves it back to
//! a full descriptor to learn the key and record types of the batch.
use std::sync::{Mutex, PoisonError};

use bytes::{BufMut, BytesMut};
use log::trace;

use crate::{
    descriptor::{Descriptor, ENGINE_ID},
    protocol::{
        batch::CommandBatch,
        codec::CommandCodec,
        command::Command,
        wire::{self, CodecError},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Target table, or `None` for engine-level commands.
    pub descriptor: Option<Descriptor>,
    pub batch: CommandBatch,
}

impl Message {
    pub fn table(descriptor: Descriptor, batch: CommandBatch) -> Self {
        Self {
            descriptor: Some(descriptor),
            batch,
        }
    }

    pub fn engine(batch: CommandBatch) -> Self {
        Self {
            descriptor: None,
            batch,
        }
    }

    /// Engine-level message carrying a single exception.
    pub fn exception(message: impl Into<String>) -> Self {
        Self::engine(CommandBatch::from(Command::Exception {
            message: message.into(),
        }))
    }

    pub fn id(&self) -> i64 {
        match &self.descriptor {
            Some(descriptor) if descriptor.id > 0 => descriptor.id,
            _ => ENGINE_ID,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let id = self.id();
        let codec = match &self.descriptor {
            Some(descriptor) if id > 0 => CommandCodec::for_descriptor(descriptor),
            _ => CommandCodec::untyped(),
        };

        let mut buf = BytesMut::new();
        buf.put_i64_le(id);
        self.batch.encode(&mut buf, &codec)?;
        Ok(buf.to_vec())
    }

    /// Decodes a whole message. Positive ids are resolved with `resolve`; an
    /// id it cannot resolve fails the message.
    pub fn decode<F>(bytes: &[u8], resolve: F) -> Result<Self, CodecError>
    where
        F: FnOnce(i64) -> Option<Descriptor>,
    {
        let mut buf = bytes;
        let id = wire::get_i64(&mut buf)?;
        let (descriptor, codec) = if id > 0 {
            let descriptor = resolve(id).ok_or(CodecError::UnresolvedDescriptor(id))?;
            let codec = CommandCodec::for_descriptor(&descriptor);
            (Some(descriptor), codec)
        } else {
            (None, CommandCodec::untyped())
        };

        let batch = CommandBatch::decode(&mut buf, &codec)?;
        wire::expect_end(buf)?;
        Ok(Self { descriptor, batch })
    }
}

/// Single-entry memo in front of a descriptor lookup. Consecutive messages
/// for the same table skip the lookup.
#[derive(Debug, Default)]
pub struct DescriptorCache {
    last: Mutex<Option<Descriptor>>,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve<F>(&self, id: i64, lookup: F) -> Option<Descriptor>
    where
        F: FnOnce(i64) -> Option<Descriptor>,
    {
        {
            let last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(descriptor) = last.as_ref().filter(|d| d.id == id) {
                return Some(descriptor.clone());
            }
        }

        trace!("descriptor cache miss for id {id}");
        let found = lookup(id)?;
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(found.clone());
        Some(found)
    }

    /// Drops the cached entry, e.g. after the table it names was deleted.
    pub fn invalidate(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
