use std::path::Path;

use tracing::*;

use crate::{
    errors::{DbError, DbResult},
    traits::{check_partition, Entry, MergeFn, Repository},
};

const SEP: u8 = 0;
const TREE_NAME: &str = "records";

/// [`Repository`] over a sled tree.
///
/// Keys are `partition ++ 0x00 ++ row`, so a partition prefix scan is a plain
/// sled prefix scan.
#[derive(Debug, Clone)]
pub struct SledRepository {
    tree: sled::Tree,
}

impl SledRepository {
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let db = sled::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "opened sled repository");
        Self::from_db(&db)
    }

    /// Opens a store that is deleted when dropped.
    pub fn temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(&db)
    }

    pub fn from_db(db: &sled::Db) -> DbResult<Self> {
        Ok(Self {
            tree: db.open_tree(TREE_NAME)?,
        })
    }

    /// Waits until every write so far is on disk. Writes are otherwise
    /// flushed in the background by sled.
    pub async fn flush(&self) -> DbResult<()> {
        let bytes = self.tree.flush_async().await?;
        trace!(%bytes, "flushed sled repository");
        Ok(())
    }

    fn key(partition: &str, row: &str) -> DbResult<Vec<u8>> {
        check_partition(partition)?;
        let mut key = Vec::with_capacity(partition.len() + row.len() + 1);
        key.extend_from_slice(partition.as_bytes());
        key.push(SEP);
        key.extend_from_slice(row.as_bytes());
        Ok(key)
    }

    fn split_key(key: &[u8]) -> DbResult<(String, String)> {
        let pos = key
            .iter()
            .position(|b| *b == SEP)
            .ok_or(DbError::MalformedKey)?;
        let partition = String::from_utf8(key[..pos].to_vec()).map_err(|_| DbError::MalformedKey)?;
        let row = String::from_utf8(key[pos + 1..].to_vec()).map_err(|_| DbError::MalformedKey)?;
        Ok((partition, row))
    }
}

impl Repository for SledRepository {
    fn get(&self, partition: &str, row: &str) -> DbResult<Option<Vec<u8>>> {
        let key = Self::key(partition, row)?;
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn list(&self, partition_prefix: &str) -> DbResult<Vec<Entry>> {
        check_partition(partition_prefix)?;
        self.tree
            .scan_prefix(partition_prefix.as_bytes())
            .map(|item| {
                let (k, v) = item?;
                let (partition, row) = Self::split_key(&k)?;
                Ok(Entry {
                    partition,
                    row,
                    value: v.to_vec(),
                })
            })
            .collect()
    }

    fn upsert(
        &self,
        partition: &str,
        row: &str,
        value: Vec<u8>,
        merge: MergeFn<'_>,
    ) -> DbResult<Vec<u8>> {
        let key = Self::key(partition, row)?;
        let stored = self.tree.update_and_fetch(&key, |old| match old {
            Some(existing) => Some(merge(existing, value.as_slice())),
            None => Some(value.clone()),
        })?;

        trace!(%partition, %row, "upserted record");
        stored
            .map(|v| v.to_vec())
            .ok_or_else(|| DbError::other("record vanished during upsert"))
    }
}
