//! Storage engine contract.
//!
//! The protocol layer never touches tables or heaps directly. It drives any
//! engine implementing [`StorageEngine`], which hands out [`Table`]s by id and
//! exposes one shared [`Heap`].
//!
//! # Key Components
//!
//! - [`StorageEngine`]: catalogue operations (open, find, rename, delete, commit).
//! - [`Table`]: ordered key/record operations on one table.
//! - [`Heap`]: handle-addressed blob store.
//! - [`MemoryEngine`]: the bundled in-memory engine with snapshot persistence.
//!
//! # See Also
//!
//! - [`Dispatcher`](crate::protocol::Dispatcher): executes decoded commands against an engine.
pub mod heap;
pub mod memory;
pub mod snapshot;

use std::sync::Arc;

use crate::{
    data::{Data, DataType},
    descriptor::Descriptor,
    protocol::Row,
};

pub use error::{SnapshotError, StorageError};
pub use heap::MemoryHeap;
pub use memory::{MemoryEngine, MemoryTable};

pub mod error {
    use std::io;

    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum SnapshotError {
        #[error("snapshot io error: {0}")]
        Io(#[from] io::Error),
        #[error("failed to encode snapshot: {0}")]
        Serialize(#[from] bincode::error::EncodeError),
        #[error("failed to decode snapshot: {0}")]
        Deserialize(#[from] bincode::error::DecodeError),
    }

    #[derive(Debug, Error)]
    pub enum StorageError {
        #[error("table '{0}' does not exist")]
        UnknownTable(String),

        #[error("no structure with id {0}")]
        UnknownId(i64),

        #[error("structure '{0}' already exists")]
        AlreadyExists(String),

        #[error("table '{name}' is declared {declared}, requested {requested}")]
        SchemaMismatch {
            name: String,
            declared: String,
            requested: String,
        },

        #[error("invalid range: from {from} to {to}")]
        InvalidRange { from: String, to: String },

        #[error("invalid heap handle {0}")]
        InvalidHandle(i64),

        #[error("heap is closed")]
        HeapClosed,

        #[error("write of {count} bytes at {index} exceeds buffer of {len}")]
        WriteBounds { index: i32, count: i32, len: usize },

        #[error("[snapshot]: {cause}")]
        Snapshot { cause: SnapshotError },
    }

    impl From<SnapshotError> for StorageError {
        fn from(cause: SnapshotError) -> Self {
            StorageError::Snapshot { cause }
        }
    }
}

/// A storage engine that can be served remotely.
///
/// All methods take `&self`; implementations synchronize internally because
/// the server executes requests from many connections in parallel.
pub trait StorageEngine: Send + Sync + 'static {
    type Table: Table;
    type Heap: Heap;

    /// Opens a table by name, creating it with the given types if missing.
    fn open_table(
        &self,
        name: &str,
        key_type: DataType,
        record_type: DataType,
    ) -> Result<Descriptor, StorageError>;

    /// Opens a file structure by name, creating it if missing, and returns its id.
    fn open_file(&self, name: &str) -> Result<i64, StorageError>;

    fn table(&self, id: i64) -> Result<Arc<Self::Table>, StorageError>;

    fn find_by_id(&self, id: i64) -> Result<Option<Descriptor>, StorageError>;

    fn find_by_name(&self, name: &str) -> Result<Option<Descriptor>, StorageError>;

    fn enumerate(&self) -> Result<Vec<Descriptor>, StorageError>;

    fn rename(&self, name: &str, new_name: &str) -> Result<(), StorageError>;

    fn delete(&self, name: &str) -> Result<(), StorageError>;

    fn exists(&self, name: &str) -> Result<bool, StorageError>;

    fn count(&self) -> Result<u64, StorageError>;

    fn cache_size(&self) -> i32;

    fn set_cache_size(&self, cache_size: i32);

    fn commit(&self) -> Result<(), StorageError>;

    fn heap(&self) -> &Self::Heap;
}

/// Ordered key/record table.
///
/// Range bounds are inclusive. `forward` walks ascending keys from `from` up
/// to `to`; `backward` walks descending keys from `from` down to `to`.
pub trait Table: Send + Sync {
    fn descriptor(&self) -> Descriptor;

    fn set_tag(&self, tag: Option<Vec<u8>>);

    fn replace(&self, key: Data, record: Data) -> Result<(), StorageError>;

    fn insert_or_ignore(&self, key: Data, record: Data) -> Result<(), StorageError>;

    fn delete(&self, key: &Data) -> Result<(), StorageError>;

    fn delete_range(&self, from: &Data, to: &Data) -> Result<(), StorageError>;

    fn clear(&self) -> Result<(), StorageError>;

    fn try_get(&self, key: &Data) -> Result<Option<Data>, StorageError>;

    fn forward(
        &self,
        from: Option<&Data>,
        to: Option<&Data>,
        limit: usize,
    ) -> Result<Vec<Row>, StorageError>;

    fn backward(
        &self,
        from: Option<&Data>,
        to: Option<&Data>,
        limit: usize,
    ) -> Result<Vec<Row>, StorageError>;

    /// First row with key `>= key`.
    fn find_next(&self, key: &Data) -> Result<Option<Row>, StorageError>;

    /// First row with key `> key`.
    fn find_after(&self, key: &Data) -> Result<Option<Row>, StorageError>;

    /// Last row with key `<= key`.
    fn find_prev(&self, key: &Data) -> Result<Option<Row>, StorageError>;

    /// Last row with key `< key`.
    fn find_before(&self, key: &Data) -> Result<Option<Row>, StorageError>;

    fn first_row(&self) -> Result<Option<Row>, StorageError>;

    fn last_row(&self) -> Result<Option<Row>, StorageError>;

    fn count(&self) -> Result<i64, StorageError>;

    /// Makes pending changes visible to other readers of the table.
    fn flush(&self) -> Result<(), StorageError>;
}

/// Blob store addressed by engine-assigned handles.
pub trait Heap: Send + Sync {
    fn obtain_handle(&self) -> Result<i64, StorageError>;

    fn release_handle(&self, handle: i64) -> Result<(), StorageError>;

    fn exists(&self, handle: i64) -> Result<bool, StorageError>;

    fn write(&self, handle: i64, data: &[u8]) -> Result<(), StorageError>;

    fn read(&self, handle: i64) -> Result<Option<Vec<u8>>, StorageError>;

    fn commit(&self) -> Result<(), StorageError>;

    fn close(&self) -> Result<(), StorageError>;

    fn set_tag(&self, tag: Option<Vec<u8>>) -> Result<(), StorageError>;

    fn tag(&self) -> Result<Option<Vec<u8>>, StorageError>;

    /// Bytes of stored blob content.
    fn data_size(&self) -> Result<i64, StorageError>;

    /// Bytes of blob content plus per-handle bookkeeping.
    fn size(&self) -> Result<i64, StorageError>;
}
