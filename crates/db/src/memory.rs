use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::{
    errors::DbResult,
    traits::{check_partition, Entry, MergeFn, Repository},
};

/// Volatile [`Repository`] for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    records: RwLock<BTreeMap<(String, String), Vec<u8>>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Repository for InMemoryRepository {
    fn get(&self, partition: &str, row: &str) -> DbResult<Option<Vec<u8>>> {
        check_partition(partition)?;
        Ok(self
            .records
            .read()
            .get(&(partition.to_owned(), row.to_owned()))
            .cloned())
    }

    fn list(&self, partition_prefix: &str) -> DbResult<Vec<Entry>> {
        check_partition(partition_prefix)?;
        Ok(self
            .records
            .read()
            .iter()
            .filter(|((p, _), _)| p.starts_with(partition_prefix))
            .map(|((partition, row), value)| Entry {
                partition: partition.clone(),
                row: row.clone(),
                value: value.clone(),
            })
            .collect())
    }

    fn upsert(
        &self,
        partition: &str,
        row: &str,
        value: Vec<u8>,
        merge: MergeFn<'_>,
    ) -> DbResult<Vec<u8>> {
        check_partition(partition)?;
        let mut records = self.records.write();
        let slot = records
            .entry((partition.to_owned(), row.to_owned()))
            .and_modify(|existing| *existing = merge(existing.as_slice(), value.as_slice()))
            .or_insert_with(|| value.clone());
        Ok(slot.clone())
    }
}
