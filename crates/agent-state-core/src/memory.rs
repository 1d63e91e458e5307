use std::collections::{BTreeMap, HashMap};

use crate::{
    check_patch, ensure_id, stamp_created, stamp_updated, Filter, Record, StorageInterface,
    StorageResult,
};

/// In-process backend for development and tests.
///
/// Any table name is accepted and created on first touch; unlike the relational
/// backends there is no closed entity map and no schema. There is no internal
/// locking either, so shared use needs external mutual exclusion.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: HashMap<String, MemoryTable>,
}

#[derive(Debug, Default)]
struct MemoryTable {
    next_position: u64,
    positions: HashMap<String, u64>,
    rows: BTreeMap<u64, Record>,
}

impl MemoryTable {
    fn get(&self, id: &str) -> Option<&Record> {
        self.positions.get(id).and_then(|position| self.rows.get(position))
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Record> {
        let position = self.positions.get(id)?;
        self.rows.get_mut(position)
    }

    fn put(&mut self, id: String, record: Record) {
        // A reused id keeps its original position.
        let position = *self.positions.entry(id).or_insert_with(|| {
            let position = self.next_position;
            self.next_position += 1;
            position
        });
        self.rows.insert(position, record);
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.positions.remove(id) {
            Some(position) => self.rows.remove(&position).is_some(),
            None => false,
        }
    }
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table_mut(&mut self, table: &str) -> &mut MemoryTable {
        self.tables.entry(table.to_string()).or_default()
    }

    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        let mut names = self.tables.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

impl StorageInterface for MemoryStorage {
    fn create(&mut self, table: &str, mut data: Record) -> StorageResult<Record> {
        let id = ensure_id(&mut data)?;
        stamp_created(&mut data)?;
        tracing::debug!(table, id = %id, "memory create");
        self.table_mut(table).put(id, data.clone());
        Ok(data)
    }

    fn get(&mut self, table: &str, id: &str) -> StorageResult<Option<Record>> {
        Ok(self.table_mut(table).get(id).cloned())
    }

    fn update(&mut self, table: &str, id: &str, data: Record) -> StorageResult<Option<Record>> {
        check_patch(&data)?;
        let Some(record) = self.table_mut(table).get_mut(id) else {
            return Ok(None);
        };
        tracing::debug!(table, id, fields = data.len(), "memory update");
        for (field, value) in data {
            record.insert(field, value);
        }
        stamp_updated(record)?;
        Ok(Some(record.clone()))
    }

    fn delete(&mut self, table: &str, id: &str) -> StorageResult<bool> {
        let removed = self.table_mut(table).remove(id);
        tracing::debug!(table, id, removed, "memory delete");
        Ok(removed)
    }

    fn list(&mut self, table: &str, filter: &Filter) -> StorageResult<Vec<Record>> {
        Ok(self
            .table_mut(table)
            .rows
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }
}
