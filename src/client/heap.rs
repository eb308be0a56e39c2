use std::sync::Arc;

use crate::{
    error::Result,
    protocol::{Command, Transport},
};

use super::{expect_result, request};

/// The remote engine's blob heap. Every call is one round trip.
#[derive(Clone)]
pub struct RemoteHeap {
    transport: Arc<dyn Transport>,
}

impl RemoteHeap {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    fn request(&self, command: Command) -> Result<Command> {
        request(&*self.transport, command)
    }

    pub fn obtain_handle(&self) -> Result<i64> {
        let result = self.request(Command::ObtainHandle { handle: 0 })?;
        expect_result!(result, Command::ObtainHandle { handle } => handle)
    }

    pub fn release(&self, handle: i64) -> Result<()> {
        self.request(Command::ReleaseHandle { handle })?;
        Ok(())
    }

    pub fn exists(&self, handle: i64) -> Result<bool> {
        let result = self.request(Command::HandleExists {
            handle,
            exists: false,
        })?;
        expect_result!(result, Command::HandleExists { exists, .. } => exists)
    }

    /// Replaces the blob behind `handle` with `buffer`.
    pub fn write(&self, handle: i64, buffer: &[u8]) -> Result<()> {
        let count = i32::try_from(buffer.len()).unwrap_or(i32::MAX);
        self.write_range(handle, buffer.to_vec(), 0, count)
    }

    /// Replaces the blob behind `handle` with `buffer[index..index + count]`.
    /// The server checks the bounds.
    pub fn write_range(&self, handle: i64, buffer: Vec<u8>, index: i32, count: i32) -> Result<()> {
        self.request(Command::HeapWrite {
            handle,
            buffer: Some(buffer),
            index,
            count,
        })?;
        Ok(())
    }

    pub fn read(&self, handle: i64) -> Result<Option<Vec<u8>>> {
        let result = self.request(Command::HeapRead {
            handle,
            buffer: None,
        })?;
        expect_result!(result, Command::HeapRead { buffer, .. } => buffer)
    }

    pub fn commit(&self) -> Result<()> {
        self.request(Command::HeapCommit)?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.request(Command::HeapClose)?;
        Ok(())
    }

    pub fn set_tag(&self, tag: Option<Vec<u8>>) -> Result<()> {
        self.request(Command::HeapSetTag { tag })?;
        Ok(())
    }

    pub fn tag(&self) -> Result<Option<Vec<u8>>> {
        let result = self.request(Command::HeapGetTag { tag: None })?;
        expect_result!(result, Command::HeapGetTag { tag } => tag)
    }

    /// Bytes stored in live blobs.
    pub fn data_size(&self) -> Result<i64> {
        let result = self.request(Command::HeapDataSize { size: 0 })?;
        expect_result!(result, Command::HeapDataSize { size } => size)
    }

    /// Total footprint, including per-handle bookkeeping.
    pub fn size(&self) -> Result<i64> {
        let result = self.request(Command::HeapSize { size: 0 })?;
        expect_result!(result, Command::HeapSize { size } => size)
    }
}
