use serde::{de::DeserializeOwned, Serialize};

use crate::errors::{DbError, DbResult};

/// Combines the currently stored value with an incoming one.
pub type MergeFn<'a> = &'a (dyn Fn(&[u8], &[u8]) -> Vec<u8> + Send + Sync);

/// One stored record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    pub partition: String,
    pub row: String,
    pub value: Vec<u8>,
}

/// Key/value store addressed by `(partition, row)`.
///
/// Writes to a single key are atomic. Implementations must tolerate reads
/// concurrent with writes from another thread.
pub trait Repository: Send + Sync + 'static {
    /// Fetches the value stored under `(partition, row)`.
    fn get(&self, partition: &str, row: &str) -> DbResult<Option<Vec<u8>>>;

    /// Lists every record whose partition starts with `partition_prefix`, in
    /// key order.
    fn list(&self, partition_prefix: &str) -> DbResult<Vec<Entry>>;

    /// Inserts `value`, or replaces the existing value with
    /// `merge(existing, value)`. Returns what ends up stored.
    fn upsert(
        &self,
        partition: &str,
        row: &str,
        value: Vec<u8>,
        merge: MergeFn<'_>,
    ) -> DbResult<Vec<u8>>;
}

/// Keeps the incoming value.
pub fn replace(_existing: &[u8], incoming: &[u8]) -> Vec<u8> {
    incoming.to_vec()
}

/// JSON helpers on top of the raw byte interface.
pub trait RepositoryExt: Repository {
    fn get_json<T: DeserializeOwned>(&self, partition: &str, row: &str) -> DbResult<Option<T>> {
        self.get(partition, row)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(DbError::from))
            .transpose()
    }

    fn list_json<T: DeserializeOwned>(&self, partition_prefix: &str) -> DbResult<Vec<(Entry, T)>> {
        self.list(partition_prefix)?
            .into_iter()
            .map(|entry| {
                let value = serde_json::from_slice(&entry.value)?;
                Ok((entry, value))
            })
            .collect()
    }

    /// Serializes `value` and stores it, replacing whatever was there.
    fn put_json<T: Serialize>(&self, partition: &str, row: &str, value: &T) -> DbResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.upsert(partition, row, bytes, &replace)?;
        Ok(())
    }
}

impl<R: Repository + ?Sized> RepositoryExt for R {}

pub(crate) fn check_partition(partition: &str) -> DbResult<()> {
    if partition.as_bytes().contains(&0) {
        return Err(DbError::InvalidPartition(partition.to_owned()));
    }
    Ok(())
}
