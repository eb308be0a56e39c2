use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

use bincode::{Decode, Encode};
use log::{debug, info};

use super::{Heap, StorageError, snapshot::SnapshotFile};

const HEAP_NAME: &str = "heap.db";

/// Bookkeeping charged per live handle by [`Heap::size`].
const HANDLE_OVERHEAD: i64 = 16;

#[derive(Debug, Default, Clone, Encode, Decode)]
struct HeapState {
    next_handle: i64,
    blobs: BTreeMap<i64, Option<Vec<u8>>>,
    tag: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Inner {
    state: HeapState,
    closed: bool,
}

/// In-memory blob heap. Handles are allocated from 1 upward and never reused.
#[derive(Debug)]
pub struct MemoryHeap {
    inner: Mutex<Inner>,
    snapshot: Option<SnapshotFile>,
}

impl MemoryHeap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            snapshot: None,
        }
    }

    /// Heap persisted under `dir` on every [`Heap::commit`].
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        let snapshot = SnapshotFile::new(dir.join(HEAP_NAME));
        let state: HeapState = snapshot.load()?.unwrap_or_default();
        info!("heap opened with {} handles", state.blobs.len());
        Ok(Self {
            inner: Mutex::new(Inner {
                state,
                closed: false,
            }),
            snapshot: Some(snapshot),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return Err(StorageError::HeapClosed);
        }
        Ok(inner)
    }
}

impl Default for MemoryHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap for MemoryHeap {
    fn obtain_handle(&self) -> Result<i64, StorageError> {
        let mut inner = self.lock()?;
        inner.state.next_handle += 1;
        let handle = inner.state.next_handle;
        inner.state.blobs.insert(handle, None);
        debug!("heap handle {handle} obtained");
        Ok(handle)
    }

    fn release_handle(&self, handle: i64) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        inner
            .state
            .blobs
            .remove(&handle)
            .map(|_| ())
            .ok_or(StorageError::InvalidHandle(handle))
    }

    fn exists(&self, handle: i64) -> Result<bool, StorageError> {
        Ok(self.lock()?.state.blobs.contains_key(&handle))
    }

    fn write(&self, handle: i64, data: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let slot = inner
            .state
            .blobs
            .get_mut(&handle)
            .ok_or(StorageError::InvalidHandle(handle))?;
        *slot = Some(data.to_vec());
        Ok(())
    }

    fn read(&self, handle: i64) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = self.lock()?;
        inner
            .state
            .blobs
            .get(&handle)
            .cloned()
            .ok_or(StorageError::InvalidHandle(handle))
    }

    fn commit(&self) -> Result<(), StorageError> {
        let state = self.lock()?.state.clone();
        if let Some(snapshot) = &self.snapshot {
            snapshot.store(&state)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        inner.closed = true;
        info!("heap closed");
        Ok(())
    }

    fn set_tag(&self, tag: Option<Vec<u8>>) -> Result<(), StorageError> {
        self.lock()?.state.tag = tag;
        Ok(())
    }

    fn tag(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock()?.state.tag.clone())
    }

    fn data_size(&self) -> Result<i64, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .state
            .blobs
            .values()
            .flatten()
            .map(|blob| blob.len() as i64)
            .sum())
    }

    fn size(&self) -> Result<i64, StorageError> {
        let handles = self.lock()?.state.blobs.len() as i64;
        Ok(self.data_size()? + handles * HANDLE_OVERHEAD)
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn handles_are_unique() {
        let heap = MemoryHeap::new();
        let a = heap.obtain_handle().unwrap();
        let b = heap.obtain_handle().unwrap();
        assert_ne!(a, b);

        heap.release_handle(a).unwrap();
        assert!(!heap.exists(a).unwrap());
        assert!(heap.exists(b).unwrap());
        assert!(heap.obtain_handle().unwrap() > b);
    }

    #[test]
    fn write_then_read() {
        let heap = MemoryHeap::new();
        let handle = heap.obtain_handle().unwrap();
        assert_eq!(heap.read(handle).unwrap(), None);

        heap.write(handle, b"payload").unwrap();
        assert_eq!(heap.read(handle).unwrap(), Some(b"payload".to_vec()));
        assert_eq!(heap.data_size().unwrap(), 7);
        assert_eq!(heap.size().unwrap(), 7 + HANDLE_OVERHEAD);
    }

    #[test]
    fn unknown_handle() {
        let heap = MemoryHeap::new();
        assert!(matches!(
            heap.write(42, b"x"),
            Err(StorageError::InvalidHandle(42))
        ));
        assert!(matches!(
            heap.release_handle(42),
            Err(StorageError::InvalidHandle(42))
        ));
    }

    #[test]
    fn closed_heap_rejects_operations() {
        let heap = MemoryHeap::new();
        heap.close().unwrap();
        assert!(matches!(heap.obtain_handle(), Err(StorageError::HeapClosed)));
    }

    #[test]
    fn committed_heap_survives_reopen() {
        let temp = TempDir::new("heap").unwrap();
        let handle = {
            let heap = MemoryHeap::open(temp.path()).unwrap();
            let handle = heap.obtain_handle().unwrap();
            heap.write(handle, b"kept").unwrap();
            heap.set_tag(Some(b"t".to_vec())).unwrap();
            heap.commit().unwrap();

            // not committed
            heap.write(handle, b"lost").unwrap();
            handle
        };

        let heap = MemoryHeap::open(temp.path()).unwrap();
        assert_eq!(heap.read(handle).unwrap(), Some(b"kept".to_vec()));
        assert_eq!(heap.tag().unwrap(), Some(b"t".to_vec()));
    }
}
