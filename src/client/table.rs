use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use log::{debug, error, trace};

use crate::{
    config::ClientConfig,
    data::Data,
    descriptor::Descriptor,
    error::{Error, Result},
    protocol::{Command, CommandBatch, CommandCode, CommandCodec, Message, Row, Transport},
};

use super::{
    expect_result, send,
    scan::{Direction, Page, RemoteScan},
};

/// Handle to one table on a remote engine.
///
/// Fire-and-forget mutations are buffered locally and sent together; any
/// synchronous command flushes the buffer first so results always reflect
/// every earlier call on this handle. The buffer is flushed when it reaches
/// either its command capacity or its byte budget. Clones share one buffer.
#[derive(Clone)]
pub struct RemoteTable {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    codec: CommandCodec,
    capacity: usize,
    batch_bytes: usize,
    page_size: usize,
    state: Mutex<TableState>,
}

struct TableState {
    descriptor: Descriptor,
    batch: CommandBatch,
    /// Encoded size of `batch`.
    pending_bytes: usize,
    scratch: BytesMut,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.batch.is_empty() {
            return;
        }
        if let Err(e) = flush(&*self.transport, state) {
            error!("dropped {} with unsent commands: {e}", state.descriptor);
        }
    }
}

/// Sends the pending batch, preceded by a descriptor round trip. The batch
/// is cleared whether or not the send succeeds.
fn flush(transport: &dyn Transport, state: &mut TableState) -> Result<Option<Command>> {
    let batch = std::mem::take(&mut state.batch);
    state.pending_bytes = 0;
    sync_descriptor(transport, state)?;
    if batch.is_empty() {
        return Ok(None);
    }

    trace!(
        "flushing {} commands to {} (common code {:?})",
        batch.len(),
        state.descriptor,
        batch.common_code()
    );
    let message = Message::table(state.descriptor.clone(), batch);
    Ok(send(transport, &message)?.into_commands().pop())
}

/// Pushes the local descriptor, then replaces it with the server's copy.
fn sync_descriptor(transport: &dyn Transport, state: &mut TableState) -> Result<()> {
    let request: CommandBatch = [
        Command::DescriptorSet {
            descriptor: Some(state.descriptor.clone()),
        },
        Command::DescriptorGet { descriptor: None },
    ]
    .into_iter()
    .collect();
    let message = Message::table(state.descriptor.clone(), request);

    let result = send(transport, &message)?
        .into_commands()
        .pop()
        .ok_or_else(|| Error::UnexpectedResponse("empty descriptor response".into()))?;
    state.descriptor =
        expect_result!(result, Command::DescriptorGet { descriptor: Some(d) } => d)?;
    Ok(())
}

/// Checks that a synchronous command got a result of its own kind.
fn match_result(
    code: CommandCode,
    synchronous: bool,
    result: Option<Command>,
) -> Result<Option<Command>> {
    if !synchronous {
        return Ok(None);
    }
    match result {
        Some(result) if result.code() == code => Ok(Some(result)),
        other => Err(Error::UnexpectedResponse(format!(
            "expected {code:?}, got {:?}",
            other.map(|c| c.code())
        ))),
    }
}

impl RemoteTable {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        descriptor: Descriptor,
        config: &ClientConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                codec: CommandCodec::for_descriptor(&descriptor),
                capacity: config.batch_capacity,
                batch_bytes: config.batch_bytes,
                page_size: config.effective_page_size(),
                state: Mutex::new(TableState {
                    descriptor,
                    batch: CommandBatch::new(),
                    pending_bytes: 0,
                    scratch: BytesMut::new(),
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TableState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest descriptor seen from the server, with any local tag change.
    pub fn descriptor(&self) -> Descriptor {
        self.state().descriptor.clone()
    }

    /// Sets the table tag locally; it reaches the server on the next flush.
    pub fn set_tag(&self, tag: Option<Vec<u8>>) {
        self.state().descriptor.tag = tag;
    }

    /// Drops every pending command without sending it.
    pub(crate) fn discard(&self) -> usize {
        let mut state = self.state();
        let dropped = state.batch.len();
        state.batch.clear();
        state.pending_bytes = 0;
        dropped
    }

    /// Queues a command, flushing when the batch is full or the command needs
    /// an answer. Returns the server's result for synchronous commands.
    ///
    /// Every command is encoded once up front, so a value the table's schema
    /// cannot encode is rejected here instead of poisoning a whole batch.
    fn execute(&self, command: Command) -> Result<Option<Command>> {
        let code = command.code();
        let synchronous = command.is_synchronous();
        let transport = &*self.inner.transport;

        let mut guard = self.state();
        let state = &mut *guard;
        let size = self.inner.codec.command_len(&command, &mut state.scratch)?;

        // Unbatched: a singleton batch, no descriptor round trip.
        if self.inner.capacity == 0 {
            let message = Message::table(state.descriptor.clone(), CommandBatch::from(command));
            let result = send(transport, &message)?.into_commands().pop();
            return match_result(code, synchronous, result);
        }

        if !state.batch.is_empty() && state.pending_bytes + size > self.inner.batch_bytes {
            trace!("batch byte budget reached at {} bytes", state.pending_bytes);
            flush(transport, state)?;
        }
        state.batch.push(command);
        state.pending_bytes += size;

        let full = state.batch.len() >= self.inner.capacity
            || state.pending_bytes >= self.inner.batch_bytes;
        if !(full || synchronous) {
            return Ok(None);
        }
        let result = flush(transport, state)?;
        match_result(code, synchronous, result)
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.execute(command)?;
        Ok(())
    }

    fn request(&self, command: Command) -> Result<Command> {
        let code = command.code();
        self.execute(command)?
            .ok_or_else(|| Error::UnexpectedResponse(format!("{code:?} carried no result")))
    }

    /// Sends every pending command.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state();
        if !state.batch.is_empty() {
            debug!("flushing {} pending commands", state.batch.len());
        }
        flush(&*self.inner.transport, &mut state)?;
        Ok(())
    }

    /// Flushes and releases this handle.
    pub fn close(self) -> Result<()> {
        self.flush()
    }

    pub fn replace(&self, key: impl Into<Data>, record: impl Into<Data>) -> Result<()> {
        self.submit(Command::Replace {
            key: key.into(),
            record: record.into(),
        })
    }

    pub fn insert_or_ignore(&self, key: impl Into<Data>, record: impl Into<Data>) -> Result<()> {
        self.submit(Command::InsertOrIgnore {
            key: key.into(),
            record: record.into(),
        })
    }

    pub fn delete(&self, key: impl Into<Data>) -> Result<()> {
        self.submit(Command::Delete { key: key.into() })
    }

    /// Deletes every row with a key in `[from, to]`.
    pub fn delete_range(&self, from: impl Into<Data>, to: impl Into<Data>) -> Result<()> {
        self.submit(Command::DeleteRange {
            from: from.into(),
            to: to.into(),
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.submit(Command::Clear)
    }

    pub fn try_get(&self, key: impl Into<Data>) -> Result<Option<Data>> {
        let result = self.request(Command::TryGet {
            key: key.into(),
            record: None,
        })?;
        expect_result!(result, Command::TryGet { record, .. } => record)
    }

    pub fn get(&self, key: impl Into<Data>) -> Result<Data> {
        let key = key.into();
        let missing = key.to_string();
        self.try_get(key)?.ok_or(Error::KeyNotFound(missing))
    }

    pub fn get_or(&self, key: impl Into<Data>, default: impl Into<Data>) -> Result<Data> {
        Ok(self.try_get(key)?.unwrap_or_else(|| default.into()))
    }

    pub fn exists(&self, key: impl Into<Data>) -> Result<bool> {
        Ok(self.try_get(key)?.is_some())
    }

    /// First row with a key `>= key`.
    pub fn find_next(&self, key: impl Into<Data>) -> Result<Option<Row>> {
        let result = self.request(Command::FindNext {
            key: key.into(),
            row: None,
        })?;
        expect_result!(result, Command::FindNext { row, .. } => row)
    }

    /// First row with a key `> key`.
    pub fn find_after(&self, key: impl Into<Data>) -> Result<Option<Row>> {
        let result = self.request(Command::FindAfter {
            key: key.into(),
            row: None,
        })?;
        expect_result!(result, Command::FindAfter { row, .. } => row)
    }

    /// Last row with a key `<= key`.
    pub fn find_prev(&self, key: impl Into<Data>) -> Result<Option<Row>> {
        let result = self.request(Command::FindPrev {
            key: key.into(),
            row: None,
        })?;
        expect_result!(result, Command::FindPrev { row, .. } => row)
    }

    /// Last row with a key `< key`.
    pub fn find_before(&self, key: impl Into<Data>) -> Result<Option<Row>> {
        let result = self.request(Command::FindBefore {
            key: key.into(),
            row: None,
        })?;
        expect_result!(result, Command::FindBefore { row, .. } => row)
    }

    pub fn first_row(&self) -> Result<Option<Row>> {
        let result = self.request(Command::FirstRow { row: None })?;
        expect_result!(result, Command::FirstRow { row } => row)
    }

    pub fn last_row(&self) -> Result<Option<Row>> {
        let result = self.request(Command::LastRow { row: None })?;
        expect_result!(result, Command::LastRow { row } => row)
    }

    pub fn count(&self) -> Result<i64> {
        let result = self.request(Command::Count { count: 0 })?;
        expect_result!(result, Command::Count { count } => count)
    }

    /// Ascending scan over `[from, to]`; either bound may be open.
    pub fn forward(&self, from: Option<Data>, to: Option<Data>) -> Result<RemoteScan> {
        if let (Some(from), Some(to)) = (&from, &to) {
            if from > to {
                return Err(invalid_range(from, to));
            }
        }
        Ok(RemoteScan::new(
            self.clone(),
            Direction::Forward,
            from,
            to,
            self.inner.page_size,
        ))
    }

    /// Descending scan from `from` down to `to`; either bound may be open.
    pub fn backward(&self, from: Option<Data>, to: Option<Data>) -> Result<RemoteScan> {
        if let (Some(from), Some(to)) = (&from, &to) {
            if from < to {
                return Err(invalid_range(from, to));
            }
        }
        Ok(RemoteScan::new(
            self.clone(),
            Direction::Backward,
            from,
            to,
            self.inner.page_size,
        ))
    }

    /// Fetches up to `page_size` rows starting at `from` inclusive.
    pub(crate) fn fetch_page(
        &self,
        direction: Direction,
        from: Option<Data>,
        to: Option<Data>,
        page_size: usize,
    ) -> Result<Page> {
        let page_count = i32::try_from(page_size).unwrap_or(i32::MAX);
        let command = match direction {
            Direction::Forward => Command::Forward {
                page_count,
                from,
                to,
                rows: None,
            },
            Direction::Backward => Command::Backward {
                page_count,
                from,
                to,
                rows: None,
            },
        };
        let result = self.request(command)?;
        expect_result!(
            result,
            Command::Forward { rows, page_count, .. } | Command::Backward { rows, page_count, .. } => Page {
                rows: rows.unwrap_or_default(),
                limit: usize::try_from(page_count).unwrap_or(0),
            }
        )
    }
}

fn invalid_range(from: &Data, to: &Data) -> Error {
    Error::InvalidRange {
        from: from.to_string(),
        to: to.to_string(),
    }
}
