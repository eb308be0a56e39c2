//! In-memory reference engine.
//!
//! Tables are `BTreeMap`s keyed by [`Data`]. The whole catalogue is written to
//! a snapshot file on [`StorageEngine::commit`] when the engine was opened on
//! a directory, and read back on the next [`MemoryEngine::open`].
use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    path::Path,
    sync::{
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicI32, Ordering},
    },
};

use bincode::{Decode, Encode};
use log::{debug, info, trace};

use super::{StorageEngine, StorageError, Table, heap::MemoryHeap, snapshot::SnapshotFile};
use crate::{
    data::{Data, DataType},
    descriptor::{Descriptor, StructureKind, Timestamp},
    protocol::Row,
};

const DATABASE_NAME: &str = "tabwire.db";
const DEFAULT_CACHE_SIZE: i32 = 1024;

pub struct MemoryTable {
    descriptor: Mutex<Descriptor>,
    rows: RwLock<BTreeMap<Data, Data>>,
}

impl MemoryTable {
    fn new(descriptor: Descriptor, rows: BTreeMap<Data, Data>) -> Self {
        Self {
            descriptor: Mutex::new(descriptor),
            rows: RwLock::new(rows),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<Data, Data>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<Data, Data>> {
        self.touch();
        self.rows.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        let mut descriptor = self.descriptor.lock().unwrap_or_else(PoisonError::into_inner);
        descriptor.modified_time = Timestamp::now();
    }

    fn rename(&self, name: &str) {
        self.descriptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .name = name.to_string();
    }

    fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            descriptor: self.descriptor(),
            rows: self
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

fn row((key, record): (&Data, &Data)) -> Row {
    (key.clone(), record.clone())
}

fn check_range(low: Option<&Data>, high: Option<&Data>) -> Result<(), StorageError> {
    match (low, high) {
        (Some(low), Some(high)) if low > high => Err(StorageError::InvalidRange {
            from: low.to_string(),
            to: high.to_string(),
        }),
        _ => Ok(()),
    }
}

fn included(bound: Option<&Data>) -> Bound<&Data> {
    bound.map_or(Bound::Unbounded, Bound::Included)
}

impl Table for MemoryTable {
    fn descriptor(&self) -> Descriptor {
        self.descriptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_tag(&self, tag: Option<Vec<u8>>) {
        self.descriptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tag = tag;
    }

    fn replace(&self, key: Data, record: Data) -> Result<(), StorageError> {
        self.write().insert(key, record);
        Ok(())
    }

    fn insert_or_ignore(&self, key: Data, record: Data) -> Result<(), StorageError> {
        self.write().entry(key).or_insert(record);
        Ok(())
    }

    fn delete(&self, key: &Data) -> Result<(), StorageError> {
        self.write().remove(key);
        Ok(())
    }

    fn delete_range(&self, from: &Data, to: &Data) -> Result<(), StorageError> {
        check_range(Some(from), Some(to))?;
        let mut rows = self.write();
        let doomed: Vec<Data> = rows
            .range::<Data, _>((Bound::Included(from), Bound::Included(to)))
            .map(|(k, _)| k.clone())
            .collect();
        trace!("deleting {} rows in range", doomed.len());
        for key in doomed {
            rows.remove(&key);
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.write().clear();
        Ok(())
    }

    fn try_get(&self, key: &Data) -> Result<Option<Data>, StorageError> {
        Ok(self.read().get(key).cloned())
    }

    fn forward(
        &self,
        from: Option<&Data>,
        to: Option<&Data>,
        limit: usize,
    ) -> Result<Vec<Row>, StorageError> {
        check_range(from, to)?;
        let rows = self.read();
        Ok(rows
            .range::<Data, _>((included(from), included(to)))
            .take(limit)
            .map(row)
            .collect())
    }

    fn backward(
        &self,
        from: Option<&Data>,
        to: Option<&Data>,
        limit: usize,
    ) -> Result<Vec<Row>, StorageError> {
        check_range(to, from).map_err(|_| StorageError::InvalidRange {
            from: from.map(Data::to_string).unwrap_or_default(),
            to: to.map(Data::to_string).unwrap_or_default(),
        })?;
        let rows = self.read();
        Ok(rows
            .range::<Data, _>((included(to), included(from)))
            .rev()
            .take(limit)
            .map(row)
            .collect())
    }

    fn find_next(&self, key: &Data) -> Result<Option<Row>, StorageError> {
        let rows = self.read();
        Ok(rows
            .range::<Data, _>((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(row))
    }

    fn find_after(&self, key: &Data) -> Result<Option<Row>, StorageError> {
        let rows = self.read();
        Ok(rows
            .range::<Data, _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(row))
    }

    fn find_prev(&self, key: &Data) -> Result<Option<Row>, StorageError> {
        let rows = self.read();
        Ok(rows
            .range::<Data, _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(row))
    }

    fn find_before(&self, key: &Data) -> Result<Option<Row>, StorageError> {
        let rows = self.read();
        Ok(rows
            .range::<Data, _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(row))
    }

    fn first_row(&self) -> Result<Option<Row>, StorageError> {
        Ok(self.read().first_key_value().map(row))
    }

    fn last_row(&self) -> Result<Option<Row>, StorageError> {
        Ok(self.read().last_key_value().map(row))
    }

    fn count(&self) -> Result<i64, StorageError> {
        Ok(self.read().len() as i64)
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Debug, Encode, Decode)]
struct TableSnapshot {
    descriptor: Descriptor,
    rows: Vec<(Data, Data)>,
}

#[derive(Debug, Encode, Decode)]
struct EngineSnapshot {
    next_id: i64,
    cache_size: i32,
    tables: Vec<TableSnapshot>,
}

#[derive(Default)]
struct Catalog {
    next_id: i64,
    tables: BTreeMap<i64, Arc<MemoryTable>>,
    names: HashMap<String, i64>,
}

impl Catalog {
    fn insert(&mut self, table: MemoryTable) -> Arc<MemoryTable> {
        let descriptor = table.descriptor();
        let table = Arc::new(table);
        self.names.insert(descriptor.name, descriptor.id);
        self.tables.insert(descriptor.id, Arc::clone(&table));
        table
    }

    fn by_name(&self, name: &str) -> Option<&Arc<MemoryTable>> {
        self.names.get(name).and_then(|id| self.tables.get(id))
    }

    fn create(
        &mut self,
        name: &str,
        kind: StructureKind,
        key_type: DataType,
        record_type: DataType,
    ) -> Arc<MemoryTable> {
        self.next_id += 1;
        let descriptor = Descriptor::new(self.next_id, name, kind, key_type, record_type);
        info!("created {descriptor}");
        self.insert(MemoryTable::new(descriptor, BTreeMap::new()))
    }
}

/// Engine keeping every table in memory.
pub struct MemoryEngine {
    catalog: RwLock<Catalog>,
    heap: MemoryHeap,
    cache_size: AtomicI32,
    snapshot: Option<SnapshotFile>,
}

impl MemoryEngine {
    /// Volatile engine; commit is a no-op.
    pub fn new() -> Self {
        Self {
            catalog: RwLock::new(Catalog::default()),
            heap: MemoryHeap::new(),
            cache_size: AtomicI32::new(DEFAULT_CACHE_SIZE),
            snapshot: None,
        }
    }

    /// Engine persisted under `dir`, restored from the last commit if any.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        let snapshot = SnapshotFile::new(dir.join(DATABASE_NAME));
        let mut catalog = Catalog::default();
        let mut cache_size = DEFAULT_CACHE_SIZE;

        if let Some(state) = snapshot.load::<EngineSnapshot>()? {
            catalog.next_id = state.next_id;
            cache_size = state.cache_size;
            for table in state.tables {
                catalog.insert(MemoryTable::new(
                    table.descriptor,
                    table.rows.into_iter().collect(),
                ));
            }
        }
        info!(
            "opened {} with {} structures",
            snapshot.path().display(),
            catalog.tables.len()
        );

        Ok(Self {
            catalog: RwLock::new(catalog),
            heap: MemoryHeap::open(dir)?,
            cache_size: AtomicI32::new(cache_size),
            snapshot: Some(snapshot),
        })
    }

    fn catalog(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn catalog_mut(&self) -> RwLockWriteGuard<'_, Catalog> {
        self.catalog.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for MemoryEngine {
    type Table = MemoryTable;
    type Heap = MemoryHeap;

    fn open_table(
        &self,
        name: &str,
        key_type: DataType,
        record_type: DataType,
    ) -> Result<Descriptor, StorageError> {
        let mut catalog = self.catalog_mut();
        if let Some(table) = catalog.by_name(name) {
            let descriptor = table.descriptor();
            if descriptor.structure_kind != StructureKind::Table
                || descriptor.key_type != key_type
                || descriptor.record_type != record_type
            {
                return Err(StorageError::SchemaMismatch {
                    name: name.to_string(),
                    declared: format!("{} -> {}", descriptor.key_type, descriptor.record_type),
                    requested: format!("{key_type} -> {record_type}"),
                });
            }
            return Ok(descriptor);
        }

        let table = catalog.create(name, StructureKind::Table, key_type, record_type);
        Ok(table.descriptor())
    }

    fn open_file(&self, name: &str) -> Result<i64, StorageError> {
        let mut catalog = self.catalog_mut();
        if let Some(table) = catalog.by_name(name) {
            let descriptor = table.descriptor();
            if descriptor.structure_kind != StructureKind::File {
                return Err(StorageError::AlreadyExists(name.to_string()));
            }
            return Ok(descriptor.id);
        }

        let file = catalog.create(name, StructureKind::File, DataType::UInt64, DataType::Bytes);
        Ok(file.descriptor().id)
    }

    fn table(&self, id: i64) -> Result<Arc<MemoryTable>, StorageError> {
        self.catalog()
            .tables
            .get(&id)
            .cloned()
            .ok_or(StorageError::UnknownId(id))
    }

    fn find_by_id(&self, id: i64) -> Result<Option<Descriptor>, StorageError> {
        Ok(self.catalog().tables.get(&id).map(|t| t.descriptor()))
    }

    fn find_by_name(&self, name: &str) -> Result<Option<Descriptor>, StorageError> {
        Ok(self.catalog().by_name(name).map(|t| t.descriptor()))
    }

    fn enumerate(&self) -> Result<Vec<Descriptor>, StorageError> {
        Ok(self.catalog().tables.values().map(|t| t.descriptor()).collect())
    }

    fn rename(&self, name: &str, new_name: &str) -> Result<(), StorageError> {
        let mut catalog = self.catalog_mut();
        if catalog.names.contains_key(new_name) {
            return Err(StorageError::AlreadyExists(new_name.to_string()));
        }
        let id = catalog
            .names
            .remove(name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_string()))?;
        catalog.names.insert(new_name.to_string(), id);
        if let Some(table) = catalog.tables.get(&id) {
            table.rename(new_name);
        }
        debug!("renamed '{name}' to '{new_name}'");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), StorageError> {
        let mut catalog = self.catalog_mut();
        let id = catalog
            .names
            .remove(name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_string()))?;
        catalog.tables.remove(&id);
        debug!("deleted '{name}'");
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.catalog().names.contains_key(name))
    }

    fn count(&self) -> Result<u64, StorageError> {
        Ok(self.catalog().tables.len() as u64)
    }

    fn cache_size(&self) -> i32 {
        self.cache_size.load(Ordering::Relaxed)
    }

    fn set_cache_size(&self, cache_size: i32) {
        self.cache_size.store(cache_size, Ordering::Relaxed);
    }

    fn commit(&self) -> Result<(), StorageError> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };

        let state = {
            let catalog = self.catalog();
            EngineSnapshot {
                next_id: catalog.next_id,
                cache_size: self.cache_size(),
                tables: catalog.tables.values().map(|t| t.snapshot()).collect(),
            }
        };
        snapshot.store(&state)?;
        info!("committed {} structures", state.tables.len());
        Ok(())
    }

    fn heap(&self) -> &MemoryHeap {
        &self.heap
    }
}
