//! Server-side execution of decoded messages.
//!
//! The [`Dispatcher`] turns one request buffer into one response buffer. It
//! never fails: malformed requests and engine errors both come back as a
//! response holding a single [`Command::Exception`].
use std::sync::Arc;

use bytes::BytesMut;
use log::{debug, error, trace, warn};
use thiserror::Error;

use crate::{
    config::MIN_PAGE_SIZE,
    descriptor::Descriptor,
    protocol::{
        batch::CommandBatch,
        codec::CommandCodec,
        command::{Command, CommandCode, Row, Scope},
        message::{DescriptorCache, Message},
        transport::MAX_FRAME_SIZE,
        wire::{self, CodecError},
    },
    storage::{Heap, StorageEngine, StorageError, Table},
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("{code:?} cannot be executed against {target}")]
    Misrouted {
        code: CommandCode,
        target: &'static str,
    },

    #[error("engine batches must hold exactly one command, got {0}")]
    EngineBatch(usize),
}

/// Encoded row bytes allowed in one scan page, leaving room in the frame
/// for the rest of the response.
pub const MAX_PAGE_BYTES: usize = MAX_FRAME_SIZE / 2;

/// Executes requests against one storage engine.
pub struct Dispatcher<E> {
    engine: Arc<E>,
    descriptors: DescriptorCache,
    page_bytes: usize,
}

impl<E: StorageEngine> Dispatcher<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            descriptors: DescriptorCache::new(),
            page_bytes: MAX_PAGE_BYTES,
        }
    }

    /// Caps the encoded size of scan pages.
    pub fn with_page_bytes(mut self, page_bytes: usize) -> Self {
        self.page_bytes = page_bytes;
        self
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Decodes, executes and re-encodes one request.
    pub fn handle(&self, request: &[u8]) -> Vec<u8> {
        let decoded = Message::decode(request, |id| {
            self.descriptors
                .resolve(id, |id| self.engine.find_by_id(id).ok().flatten())
        });

        let response = match decoded {
            Ok(message) => self.execute(message),
            Err(e) => {
                warn!("rejecting malformed request: {e}");
                Message::exception(e.to_string())
            }
        };

        match response.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to encode response: {e}");
                Message::exception(format!("failed to encode response: {e}"))
                    .encode()
                    .unwrap_or_default()
            }
        }
    }

    /// Executes a decoded message. The response reuses the request's target.
    pub fn execute(&self, message: Message) -> Message {
        let Message { descriptor, batch } = message;
        let outcome = match &descriptor {
            Some(descriptor) => self.execute_table(descriptor, batch),
            None => self.execute_engine(batch),
        };

        let batch = match outcome {
            Ok(batch) => batch,
            Err(e) => {
                debug!("batch aborted: {e}");
                CommandBatch::from(Command::Exception {
                    message: e.to_string(),
                })
            }
        };
        Message { descriptor, batch }
    }

    fn execute_table(
        &self,
        descriptor: &Descriptor,
        batch: CommandBatch,
    ) -> Result<CommandBatch, DispatchError> {
        debug!("executing {} commands against {descriptor}", batch.len());
        let table = self.engine.table(descriptor.id)?;
        let pages = PageBudget {
            codec: CommandCodec::for_descriptor(descriptor),
            bytes: self.page_bytes,
        };

        let mut results = CommandBatch::new();
        for command in batch {
            if let Some(result) = execute_table_command(&*table, &pages, command)? {
                results.push(result);
            }
        }
        table.flush()?;
        Ok(results)
    }

    fn execute_engine(&self, batch: CommandBatch) -> Result<CommandBatch, DispatchError> {
        if batch.len() != 1 {
            return Err(DispatchError::EngineBatch(batch.len()));
        }

        let mut results = CommandBatch::new();
        for command in batch {
            trace!("executing engine command {:?}", command.code());
            let result = match command.scope() {
                Scope::Engine => self.execute_engine_command(command)?,
                Scope::Heap => execute_heap_command(self.engine.heap(), command)?,
                Scope::Table | Scope::Control => {
                    return Err(DispatchError::Misrouted {
                        code: command.code(),
                        target: "the engine",
                    });
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    fn execute_engine_command(&self, command: Command) -> Result<Command, DispatchError> {
        let engine = &self.engine;
        let result = match command {
            Command::Commit => {
                engine.commit()?;
                Command::Commit
            }
            Command::Enumerate { .. } => Command::Enumerate {
                descriptors: Some(engine.enumerate()?),
            },
            Command::Rename { name, new_name } => {
                engine.rename(&name, &new_name)?;
                Command::Rename { name, new_name }
            }
            Command::Exists { name, .. } => Command::Exists {
                exists: engine.exists(&name)?,
                name,
            },
            Command::FindById { id, .. } => Command::FindById {
                id,
                descriptor: engine.find_by_id(id)?,
            },
            Command::FindByName { name, .. } => Command::FindByName {
                descriptor: engine.find_by_name(&name)?,
                name,
            },
            Command::OpenTable {
                name,
                key_type,
                record_type,
                ..
            } => {
                let descriptor =
                    engine.open_table(&name, key_type.clone(), record_type.clone())?;
                Command::OpenTable {
                    name,
                    key_type,
                    record_type,
                    descriptor: Some(descriptor),
                }
            }
            Command::OpenFile { name, .. } => Command::OpenFile {
                id: engine.open_file(&name)?,
                name,
            },
            Command::DeleteTable { name } => {
                engine.delete(&name)?;
                self.descriptors.invalidate();
                Command::DeleteTable { name }
            }
            Command::CountTables { .. } => Command::CountTables {
                count: engine.count()?,
            },
            Command::GetCacheSize { .. } => Command::GetCacheSize {
                cache_size: engine.cache_size(),
            },
            Command::SetCacheSize { cache_size } => {
                engine.set_cache_size(cache_size);
                Command::SetCacheSize { cache_size }
            }
            other => {
                return Err(DispatchError::Misrouted {
                    code: other.code(),
                    target: "the engine",
                });
            }
        };
        Ok(result)
    }
}

/// Runs one table command. Fire-and-forget commands produce no result.
fn execute_table_command<T: Table + ?Sized>(
    table: &T,
    pages: &PageBudget,
    command: Command,
) -> Result<Option<Command>, DispatchError> {
    let result = match command {
        Command::Replace { key, record } => {
            table.replace(key, record)?;
            None
        }
        Command::Delete { key } => {
            table.delete(&key)?;
            None
        }
        Command::DeleteRange { from, to } => {
            table.delete_range(&from, &to)?;
            None
        }
        Command::InsertOrIgnore { key, record } => {
            table.insert_or_ignore(key, record)?;
            None
        }
        Command::Clear => {
            table.clear()?;
            None
        }
        Command::TryGet { key, .. } => Some(Command::TryGet {
            record: table.try_get(&key)?,
            key,
        }),
        Command::Forward {
            page_count,
            from,
            to,
            ..
        } => {
            let rows = table.forward(from.as_ref(), to.as_ref(), page_limit(page_count))?;
            let (rows, page_count) = pages.fit(rows, page_count)?;
            Some(Command::Forward {
                rows: Some(rows),
                page_count,
                from,
                to,
            })
        }
        Command::Backward {
            page_count,
            from,
            to,
            ..
        } => {
            let rows = table.backward(from.as_ref(), to.as_ref(), page_limit(page_count))?;
            let (rows, page_count) = pages.fit(rows, page_count)?;
            Some(Command::Backward {
                rows: Some(rows),
                page_count,
                from,
                to,
            })
        }
        Command::FindNext { key, .. } => Some(Command::FindNext {
            row: table.find_next(&key)?,
            key,
        }),
        Command::FindAfter { key, .. } => Some(Command::FindAfter {
            row: table.find_after(&key)?,
            key,
        }),
        Command::FindPrev { key, .. } => Some(Command::FindPrev {
            row: table.find_prev(&key)?,
            key,
        }),
        Command::FindBefore { key, .. } => Some(Command::FindBefore {
            row: table.find_before(&key)?,
            key,
        }),
        Command::FirstRow { .. } => Some(Command::FirstRow {
            row: table.first_row()?,
        }),
        Command::LastRow { .. } => Some(Command::LastRow {
            row: table.last_row()?,
        }),
        Command::Count { .. } => Some(Command::Count {
            count: table.count()?,
        }),
        Command::DescriptorGet { .. } => Some(Command::DescriptorGet {
            descriptor: Some(table.descriptor()),
        }),
        Command::DescriptorSet { descriptor } => {
            if let Some(tag) = descriptor.and_then(|d| d.tag) {
                table.set_tag(Some(tag));
            }
            Some(Command::DescriptorSet { descriptor: None })
        }
        other => {
            return Err(DispatchError::Misrouted {
                code: other.code(),
                target: "a table",
            });
        }
    };
    Ok(result)
}

fn page_limit(page_count: i32) -> usize {
    usize::try_from(page_count).unwrap_or(0)
}

struct PageBudget {
    codec: CommandCodec,
    bytes: usize,
}

impl PageBudget {
    /// Cuts a page at the byte budget, keeping at least [`MIN_PAGE_SIZE`]
    /// rows. A cut page answers with its own length as `page_count`, so the
    /// client sees it as full and resumes from its last key.
    fn fit(&self, mut rows: Vec<Row>, page_count: i32) -> Result<(Vec<Row>, i32), CodecError> {
        let mut scratch = BytesMut::new();
        let mut total = 0;
        for (i, row) in rows.iter().enumerate() {
            total += self.codec.row_len(row, &mut scratch)?;
            if total > self.bytes && i >= MIN_PAGE_SIZE {
                trace!("page cut to {i} rows at {} bytes", self.bytes);
                rows.truncate(i);
                let cut = wire::count_i32(i, "row")?;
                return Ok((rows, cut));
            }
        }
        Ok((rows, page_count))
    }
}

fn execute_heap_command<H: Heap + ?Sized>(
    heap: &H,
    command: Command,
) -> Result<Command, DispatchError> {
    let result = match command {
        Command::ObtainHandle { .. } => Command::ObtainHandle {
            handle: heap.obtain_handle()?,
        },
        Command::ReleaseHandle { handle } => {
            heap.release_handle(handle)?;
            Command::ReleaseHandle { handle }
        }
        Command::HandleExists { handle, .. } => Command::HandleExists {
            handle,
            exists: heap.exists(handle)?,
        },
        Command::HeapWrite {
            handle,
            buffer,
            index,
            count,
        } => {
            let buffer = buffer.unwrap_or_default();
            let bounds = usize::try_from(index)
                .ok()
                .zip(usize::try_from(count).ok())
                .and_then(|(i, c)| Some(i..i.checked_add(c)?))
                .filter(|range| range.end <= buffer.len());
            let Some(range) = bounds else {
                return Err(StorageError::WriteBounds {
                    index,
                    count,
                    len: buffer.len(),
                }
                .into());
            };
            heap.write(handle, &buffer[range])?;
            Command::HeapWrite {
                handle,
                buffer: None,
                index,
                count,
            }
        }
        Command::HeapRead { handle, .. } => Command::HeapRead {
            handle,
            buffer: heap.read(handle)?,
        },
        Command::HeapCommit => {
            heap.commit()?;
            Command::HeapCommit
        }
        Command::HeapClose => {
            heap.close()?;
            Command::HeapClose
        }
        Command::HeapSetTag { tag } => {
            heap.set_tag(tag)?;
            Command::HeapSetTag { tag: None }
        }
        Command::HeapGetTag { .. } => Command::HeapGetTag { tag: heap.tag()? },
        Command::HeapDataSize { .. } => Command::HeapDataSize {
            size: heap.data_size()?,
        },
        Command::HeapSize { .. } => Command::HeapSize { size: heap.size()? },
        other => {
            return Err(DispatchError::Misrouted {
                code: other.code(),
                target: "the heap",
            });
        }
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{Data, DataType},
        storage::MemoryEngine,
    };

    fn setup() -> (Dispatcher<MemoryEngine>, Descriptor) {
        let engine = Arc::new(MemoryEngine::new());
        let descriptor = engine
            .open_table("people", DataType::Int64, DataType::String)
            .unwrap();
        (Dispatcher::new(engine), descriptor)
    }

    fn roundtrip(
        dispatcher: &Dispatcher<MemoryEngine>,
        descriptor: Option<&Descriptor>,
        batch: CommandBatch,
    ) -> Message {
        let request = Message {
            descriptor: descriptor.cloned(),
            batch,
        };
        let response = dispatcher.handle(&request.encode().unwrap());
        Message::decode(&response, |id| {
            descriptor.filter(|d| d.id == id).cloned()
        })
        .unwrap()
    }

    fn put(key: i64, name: &str) -> Command {
        Command::Replace {
            key: Data::Int64(key),
            record: Data::String(name.into()),
        }
    }

    #[test]
    fn nested_type_bomb_gets_exception() {
        use bytes::{BufMut, BytesMut};

        use crate::protocol::wire;

        let (dispatcher, _) = setup();
        let mut request = BytesMut::new();
        request.put_i64_le(-1);
        request.put_i32_le(1);
        request.put_i32_le(CommandCode::OpenTable as i32);
        request.put_i32_le(CommandCode::OpenTable as i32);
        wire::put_string(&mut request, "deep");
        for _ in 0..1_000_000 {
            request.put_u8(8);
            request.put_u8(1);
        }
        request.put_u8(3);

        let response = Message::decode(&dispatcher.handle(&request), |_| None).unwrap();
        match response.batch.commands() {
            [Command::Exception { message }] => assert!(message.contains("nested"), "{message}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn table_batch_collects_synchronous_results() {
        let (dispatcher, descriptor) = setup();
        let batch: CommandBatch = vec![
            put(1, "ada"),
            put(2, "bob"),
            Command::TryGet {
                key: Data::Int64(2),
                record: None,
            },
            Command::Delete { key: Data::Int64(1) },
            Command::Count { count: 0 },
        ]
        .into_iter()
        .collect();

        let response = roundtrip(&dispatcher, Some(&descriptor), batch);
        assert_eq!(response.descriptor.as_ref().map(|d| d.id), Some(descriptor.id));
        assert_eq!(
            response.batch.commands(),
            &[
                Command::TryGet {
                    key: Data::Int64(2),
                    record: Some(Data::String("bob".into())),
                },
                Command::Count { count: 1 },
            ]
        );
    }

    #[test]
    fn pages_are_cut_at_the_byte_budget() {
        let (dispatcher, descriptor) = setup();
        let dispatcher = dispatcher.with_page_bytes(100);
        let name = "x".repeat(40);
        let batch: CommandBatch = (1..=10).map(|k| put(k, &name)).collect();
        roundtrip(&dispatcher, Some(&descriptor), batch);

        let page = |command| roundtrip(&dispatcher, Some(&descriptor), CommandBatch::from(command));
        let response = page(Command::Forward {
            page_count: 100,
            from: None,
            to: None,
            rows: None,
        });
        match response.batch.commands() {
            [Command::Forward { page_count, rows: Some(rows), .. }] => {
                assert_eq!(*page_count, 2);
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[1].0, Data::Int64(2));
            }
            other => panic!("unexpected {other:?}"),
        }

        // small rows keep the requested page count
        let response = page(Command::Backward {
            page_count: 3,
            from: Some(Data::Int64(10)),
            to: Some(Data::Int64(9)),
            rows: None,
        });
        assert!(matches!(
            response.batch.commands(),
            [Command::Backward { page_count: 3, rows: Some(rows), .. }] if rows.len() == 2
        ));
    }

    #[test]
    fn engine_failure_becomes_exception() {
        let (dispatcher, descriptor) = setup();
        let batch: CommandBatch = vec![
            put(1, "ada"),
            Command::DeleteRange {
                from: Data::Int64(10),
                to: Data::Int64(5),
            },
            put(2, "never"),
        ]
        .into_iter()
        .collect();

        let response = roundtrip(&dispatcher, Some(&descriptor), batch);
        match response.batch.commands() {
            [Command::Exception { message }] => assert!(message.contains("invalid range")),
            other => panic!("unexpected response {other:?}"),
        }

        // commands before the failure ran, the rest did not
        let table = dispatcher.engine().table(descriptor.id).unwrap();
        assert_eq!(table.count().unwrap(), 1);
    }

    #[test]
    fn descriptor_set_applies_only_present_tags() {
        let (dispatcher, descriptor) = setup();
        let mut tagged = descriptor.clone();
        tagged.tag = Some(b"v2".to_vec());

        let batch: CommandBatch = vec![
            Command::DescriptorSet {
                descriptor: Some(tagged),
            },
            Command::DescriptorSet {
                descriptor: Some(descriptor.clone()),
            },
            Command::DescriptorGet { descriptor: None },
        ]
        .into_iter()
        .collect();

        let response = roundtrip(&dispatcher, Some(&descriptor), batch);
        match response.batch.last() {
            Some(Command::DescriptorGet {
                descriptor: Some(current),
            }) => assert_eq!(current.tag, Some(b"v2".to_vec())),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn engine_command_runs_alone() {
        let (dispatcher, _) = setup();
        let response = roundtrip(
            &dispatcher,
            None,
            CommandBatch::from(Command::Exists {
                name: "people".into(),
                exists: false,
            }),
        );
        assert!(response.descriptor.is_none());
        assert_eq!(
            response.batch.commands(),
            &[Command::Exists {
                name: "people".into(),
                exists: true,
            }]
        );
    }

    #[test]
    fn multi_command_engine_batch_is_rejected() {
        let (dispatcher, _) = setup();
        let batch: CommandBatch = vec![
            Command::DeleteTable {
                name: "people".into(),
            },
            Command::CountTables { count: 0 },
        ]
        .into_iter()
        .collect();

        let response = roundtrip(&dispatcher, None, batch);
        assert!(matches!(
            response.batch.commands(),
            [Command::Exception { .. }]
        ));
        // nothing was executed
        assert!(dispatcher.engine().exists("people").unwrap());
    }

    #[test]
    fn misrouted_commands_are_rejected() {
        let (dispatcher, descriptor) = setup();

        let response = roundtrip(&dispatcher, Some(&descriptor), CommandBatch::from(Command::Commit));
        assert!(matches!(response.batch.commands(), [Command::Exception { .. }]));

        let response = roundtrip(&dispatcher, None, CommandBatch::from(Command::Clear));
        assert!(matches!(response.batch.commands(), [Command::Exception { .. }]));
    }

    #[test]
    fn malformed_request_gets_exception() {
        let (dispatcher, _) = setup();
        let response = dispatcher.handle(&[1, 2, 3]);
        let response = Message::decode(&response, |_| None).unwrap();
        assert!(matches!(response.batch.commands(), [Command::Exception { .. }]));
    }

    #[test]
    fn unknown_table_id_gets_exception() {
        let (dispatcher, _) = setup();
        let ghost = Descriptor::new(
            99,
            "ghost",
            crate::descriptor::StructureKind::Table,
            DataType::Int64,
            DataType::String,
        );
        let request = Message::table(ghost, CommandBatch::from(Command::Clear));
        let response = dispatcher.handle(&request.encode().unwrap());
        match Message::decode(&response, |_| None).unwrap().batch.commands() {
            [Command::Exception { message }] => assert!(message.contains("99")),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn heap_write_respects_bounds() {
        let (dispatcher, _) = setup();
        let handle = match roundtrip(
            &dispatcher,
            None,
            CommandBatch::from(Command::ObtainHandle { handle: 0 }),
        )
        .batch
        .commands()
        {
            [Command::ObtainHandle { handle }] => *handle,
            other => panic!("unexpected response {other:?}"),
        };

        let write = |index, count| {
            roundtrip(
                &dispatcher,
                None,
                CommandBatch::from(Command::HeapWrite {
                    handle,
                    buffer: Some(b"abcdef".to_vec()),
                    index,
                    count,
                }),
            )
        };
        assert!(matches!(
            write(4, 3).batch.commands(),
            [Command::Exception { .. }]
        ));
        assert!(matches!(
            write(1, 3).batch.commands(),
            [Command::HeapWrite { .. }]
        ));

        let read = roundtrip(
            &dispatcher,
            None,
            CommandBatch::from(Command::HeapRead {
                handle,
                buffer: None,
            }),
        );
        assert_eq!(
            read.batch.commands(),
            &[Command::HeapRead {
                handle,
                buffer: Some(b"bcd".to_vec()),
            }]
        );
    }
}
