//! Client side of the protocol.
//!
//! A [`StorageClient`] is the remote counterpart of a storage engine. Tables
//! opened through it are [`RemoteTable`] handles that buffer mutations and
//! send them in batches; ordered scans come back as prefetching
//! [`RemoteScan`] iterators; the engine's heap is reachable through
//! [`RemoteHeap`].
//!
//! # Key Components
//!
//! - [`StorageClient`]: engine-level operations and the registry of open tables.
//! - [`RemoteTable`]: per-table batching and flush rules.
//! - [`RemoteScan`]: paged range scans with one page fetched ahead.
//! - [`RemoteHeap`]: handle-based blob access.
mod heap;
mod scan;
mod table;

use std::{
    collections::HashMap,
    net::ToSocketAddrs,
    sync::{Arc, Mutex, PoisonError},
};

use log::{debug, info};

use crate::{
    config::ClientConfig,
    data::DataType,
    descriptor::Descriptor,
    error::{Error, Result},
    protocol::{Command, CommandBatch, Message, TcpTransport, Transport},
};

pub use heap::RemoteHeap;
pub use scan::{Direction, RemoteScan};
pub use table::RemoteTable;

/// Sends one message and decodes the reply. Any exception in the reply is
/// raised as [`Error::Remote`].
pub(crate) fn send(transport: &dyn Transport, message: &Message) -> Result<CommandBatch> {
    let response = transport.exchange(message.encode()?)?;
    let target = message.descriptor.as_ref();
    let response = Message::decode(&response, |id| target.filter(|d| d.id == id).cloned())?;

    if let Some(message) = response.batch.iter().find_map(|c| match c {
        Command::Exception { message } => Some(message),
        _ => None,
    }) {
        return Err(Error::Remote(message.clone()));
    }
    Ok(response.batch)
}

/// Runs a single engine-level command and returns its result.
pub(crate) fn request(transport: &dyn Transport, command: Command) -> Result<Command> {
    let expected = command.code();
    let results = send(transport, &Message::engine(CommandBatch::from(command)))?;
    match results.into_commands().pop() {
        Some(result) if result.code() == expected => Ok(result),
        other => Err(Error::UnexpectedResponse(format!(
            "expected {expected:?}, got {:?}",
            other.map(|c| c.code())
        ))),
    }
}

/// Connection to a remote storage engine.
pub struct StorageClient {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    tables: Mutex<HashMap<String, RemoteTable>>,
    heap: RemoteHeap,
}

macro_rules! expect_result {
    ($result:expr, $pattern:pat => $value:expr) => {
        match $result {
            $pattern => Ok($value),
            other => Err($crate::error::Error::UnexpectedResponse(format!(
                "{:?} carried no result",
                other.code()
            ))),
        }
    };
}
pub(crate) use expect_result;

impl StorageClient {
    pub fn connect(address: impl ToSocketAddrs, config: ClientConfig) -> Result<Self> {
        let transport = TcpTransport::connect(address)?;
        Ok(Self::new(Arc::new(transport), config))
    }

    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            heap: RemoteHeap::new(Arc::clone(&transport)),
            transport,
            config,
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, HashMap<String, RemoteTable>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(&self, command: Command) -> Result<Command> {
        request(&*self.transport, command)
    }

    /// Opens (creating if needed) a table. Repeated opens of one name share
    /// a single handle and batch.
    pub fn open_table(
        &self,
        name: &str,
        key_type: DataType,
        record_type: DataType,
    ) -> Result<RemoteTable> {
        if let Some(table) = self.tables().get(name) {
            return Ok(table.clone());
        }

        let result = self.request(Command::OpenTable {
            name: name.to_string(),
            key_type,
            record_type,
            descriptor: None,
        })?;
        let descriptor = expect_result!(result, Command::OpenTable { descriptor: Some(d), .. } => d)?;
        info!("opened remote table {descriptor}");

        let table = RemoteTable::new(Arc::clone(&self.transport), descriptor, &self.config);
        let table = self
            .tables()
            .entry(name.to_string())
            .or_insert(table)
            .clone();
        Ok(table)
    }

    pub fn open_file(&self, name: &str) -> Result<i64> {
        let result = self.request(Command::OpenFile {
            name: name.to_string(),
            id: 0,
        })?;
        expect_result!(result, Command::OpenFile { id, .. } => id)
    }

    /// Renames a structure. An open handle under the old name is flushed and
    /// forgotten; reopen it under the new name.
    pub fn rename(&self, name: &str, new_name: &str) -> Result<()> {
        let open = self.tables().remove(name);
        if let Some(table) = open {
            table.flush()?;
        }
        self.request(Command::Rename {
            name: name.to_string(),
            new_name: new_name.to_string(),
        })?;
        Ok(())
    }

    /// Deletes a structure. Mutations still buffered for it are discarded.
    pub fn delete(&self, name: &str) -> Result<()> {
        let open = self.tables().remove(name);
        if let Some(table) = open {
            let dropped = table.discard();
            debug!("discarded {dropped} pending commands for '{name}'");
        }
        self.request(Command::DeleteTable {
            name: name.to_string(),
        })?;
        Ok(())
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        let result = self.request(Command::Exists {
            name: name.to_string(),
            exists: false,
        })?;
        expect_result!(result, Command::Exists { exists, .. } => exists)
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<Descriptor>> {
        let result = self.request(Command::FindById {
            id,
            descriptor: None,
        })?;
        expect_result!(result, Command::FindById { descriptor, .. } => descriptor)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<Descriptor>> {
        let result = self.request(Command::FindByName {
            name: name.to_string(),
            descriptor: None,
        })?;
        expect_result!(result, Command::FindByName { descriptor, .. } => descriptor)
    }

    pub fn enumerate(&self) -> Result<Vec<Descriptor>> {
        let result = self.request(Command::Enumerate { descriptors: None })?;
        expect_result!(result, Command::Enumerate { descriptors, .. } => descriptors.unwrap_or_default())
    }

    pub fn count(&self) -> Result<u64> {
        let result = self.request(Command::CountTables { count: 0 })?;
        expect_result!(result, Command::CountTables { count } => count)
    }

    pub fn cache_size(&self) -> Result<i32> {
        let result = self.request(Command::GetCacheSize { cache_size: 0 })?;
        expect_result!(result, Command::GetCacheSize { cache_size } => cache_size)
    }

    pub fn set_cache_size(&self, cache_size: i32) -> Result<()> {
        self.request(Command::SetCacheSize { cache_size })?;
        Ok(())
    }

    /// Flushes every open table, then commits the engine.
    pub fn commit(&self) -> Result<()> {
        self.flush()?;
        self.request(Command::Commit)?;
        info!("committed");
        Ok(())
    }

    /// Flushes every open table.
    pub fn flush(&self) -> Result<()> {
        let open: Vec<RemoteTable> = self.tables().values().cloned().collect();
        for table in open {
            table.flush()?;
        }
        Ok(())
    }

    pub fn heap(&self) -> &RemoteHeap {
        &self.heap
    }

    /// Flushes every open table and releases the connection.
    pub fn close(self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        data::Data,
        protocol::{Dispatcher, LocalTransport, TransportError},
        storage::{MemoryEngine, StorageEngine, Table},
    };

    /// In-process transport that counts round trips.
    pub(crate) struct CountingTransport {
        inner: LocalTransport<MemoryEngine>,
        calls: AtomicUsize,
    }

    impl CountingTransport {
        pub(crate) fn new() -> Arc<Self> {
            Self::with_dispatcher(Dispatcher::new(Arc::new(MemoryEngine::new())))
        }

        pub(crate) fn with_dispatcher(dispatcher: Dispatcher<MemoryEngine>) -> Arc<Self> {
            Arc::new(Self {
                inner: LocalTransport::new(Arc::new(dispatcher)),
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn engine(&self) -> &Arc<MemoryEngine> {
            self.inner.dispatcher().engine()
        }
    }

    impl Transport for CountingTransport {
        fn exchange(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.exchange(request)
        }
    }

    struct DeadTransport;

    impl Transport for DeadTransport {
        fn exchange(&self, _: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            Err(TransportError::ConnectionLost)
        }
    }

    pub(crate) fn client(config: ClientConfig) -> (StorageClient, Arc<CountingTransport>) {
        client_with(config, Dispatcher::new(Arc::new(MemoryEngine::new())))
    }

    pub(crate) fn client_with(
        config: ClientConfig,
        dispatcher: Dispatcher<MemoryEngine>,
    ) -> (StorageClient, Arc<CountingTransport>) {
        let transport = CountingTransport::with_dispatcher(dispatcher);
        let shared: Arc<dyn Transport> = transport.clone();
        (StorageClient::new(shared, config), transport)
    }

    #[test]
    fn open_table_shares_handles() {
        let (client, _) = client(ClientConfig::default());
        let a = client.open_table("t", DataType::Int64, DataType::String).unwrap();
        let b = client.open_table("t", DataType::Int64, DataType::String).unwrap();
        assert_eq!(a.descriptor().id, b.descriptor().id);

        a.replace(1_i64, "one").unwrap();
        assert_eq!(b.count().unwrap(), 1);
    }

    #[test]
    fn engine_operations() {
        let (client, _) = client(ClientConfig::default());
        client.open_table("a", DataType::Int64, DataType::String).unwrap();
        client.open_table("b", DataType::String, DataType::Bytes).unwrap();
        let file = client.open_file("f").unwrap();

        assert_eq!(client.count().unwrap(), 3);
        assert!(client.exists("a").unwrap());
        assert_eq!(client.enumerate().unwrap().len(), 3);
        assert_eq!(client.find_by_id(file).unwrap().unwrap().name, "f");

        client.rename("a", "c").unwrap();
        assert!(!client.exists("a").unwrap());
        assert!(client.find_by_name("c").unwrap().is_some());

        client.delete("b").unwrap();
        assert!(client.find_by_name("b").unwrap().is_none());

        client.set_cache_size(99).unwrap();
        assert_eq!(client.cache_size().unwrap(), 99);
    }

    #[test]
    fn remote_errors_carry_engine_message() {
        let (client, _) = client(ClientConfig::default());
        match client.rename("missing", "other") {
            Err(Error::Remote(message)) => assert!(message.contains("missing")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn commit_flushes_pending_mutations() {
        let (client, transport) = client(ClientConfig::default());
        let table = client.open_table("t", DataType::Int64, DataType::Int64).unwrap();
        for k in 0..10_i64 {
            table.replace(k, k * k).unwrap();
        }

        let id = table.descriptor().id;
        let engine_table = transport.engine().table(id).unwrap();
        assert_eq!(engine_table.count().unwrap(), 0);

        client.commit().unwrap();
        assert_eq!(engine_table.count().unwrap(), 10);
    }

    #[test]
    fn connection_loss_is_fatal() {
        let client = StorageClient::new(Arc::new(DeadTransport), ClientConfig::default());
        assert!(matches!(
            client.count(),
            Err(Error::Transport(TransportError::ConnectionLost))
        ));
    }

    #[test]
    fn works_over_tcp() {
        use crate::{config::ServerConfig, protocol::StorageServer};

        let server = StorageServer::bind(
            "127.0.0.1:0",
            Arc::new(MemoryEngine::new()),
            &ServerConfig { workers: 2 },
        )
        .unwrap();
        let address = server.local_addr().unwrap();
        std::thread::spawn(move || server.listen());

        let client = StorageClient::connect(address, ClientConfig::default().with_page_size(7)).unwrap();
        let table = client.open_table("tcp", DataType::Int64, DataType::String).unwrap();
        for k in 1..=50_i64 {
            table.replace(k, format!("v{k}")).unwrap();
        }
        let keys: Vec<Data> = table
            .forward(None, None)
            .unwrap()
            .map(|row| row.unwrap().0)
            .collect();
        assert_eq!(keys, (1..=50).map(Data::Int64).collect::<Vec<_>>());
        client.close().unwrap();
    }

    #[test]
    fn large_records_at_default_sizes_over_tcp() {
        use crate::{config::ServerConfig, protocol::StorageServer};
        const ROWS: i64 = 70_000;

        let server = StorageServer::bind(
            "127.0.0.1:0",
            Arc::new(MemoryEngine::new()),
            &ServerConfig { workers: 2 },
        )
        .unwrap();
        let address = server.local_addr().unwrap();
        std::thread::spawn(move || server.listen());

        let client = StorageClient::connect(address, ClientConfig::default()).unwrap();
        let table = client.open_table("wide", DataType::Int64, DataType::Bytes).unwrap();
        for k in 1..=ROWS {
            table.replace(k, vec![k as u8; 1000]).unwrap();
        }
        assert_eq!(table.count().unwrap(), ROWS);

        let mut expected = 1;
        for row in table.forward(None, None).unwrap() {
            let (key, record) = row.unwrap();
            assert_eq!(key, Data::Int64(expected));
            assert!(matches!(record, Data::Bytes(ref b) if b.len() == 1000));
            expected += 1;
        }
        assert_eq!(expected, ROWS + 1);
        client.close().unwrap();
    }
}
