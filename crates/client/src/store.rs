use std::{fmt, sync::Arc};

use tracing::*;
use tumbler_db::{DbResult, Repository, RepositoryExt};
use tumbler_primitives::Height;

use crate::session::PaymentSessionRecord;

const PARTITION_PREFIX: &str = "Cycle_";

/// Session records keyed by cycle start.
#[derive(Clone)]
pub struct CycleStore {
    repo: Arc<dyn Repository>,
}

impl fmt::Debug for CycleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleStore").finish_non_exhaustive()
    }
}

fn partition(start: Height) -> String {
    format!("{PARTITION_PREFIX}{start}")
}

impl CycleStore {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    pub fn load(&self, start: Height) -> DbResult<Option<PaymentSessionRecord>> {
        self.repo.get_json(&partition(start), "")
    }

    pub fn exists(&self, start: Height) -> DbResult<bool> {
        Ok(self.repo.get(&partition(start), "")?.is_some())
    }

    pub fn save(&self, record: &PaymentSessionRecord) -> DbResult<()> {
        trace!(cycle = record.start_cycle, status = ?record.state.status(), "saving session");
        self.repo.put_json(&partition(record.start_cycle), "", record)
    }

    /// Every stored record, in key order.
    pub fn load_all(&self) -> DbResult<Vec<PaymentSessionRecord>> {
        Ok(self
            .repo
            .list_json(PARTITION_PREFIX)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }
}
