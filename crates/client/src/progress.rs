//! Snapshot of where every active cycle stands, for external display.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tumbler_primitives::{CycleParameters, CyclePeriods, CyclePhase, Height};

use crate::session::PaymentStatus;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CycleProgressInfo {
    pub start: Height,
    pub height: Height,
    pub periods: CyclePeriods,
    pub phase: Option<CyclePhase>,
    pub status: PaymentStatus,
    pub ascii_art: String,
    /// Registered but never funded even though funding is over.
    pub failed: bool,
}

impl CycleProgressInfo {
    pub fn new(cycle: &CycleParameters, height: Height, status: PaymentStatus) -> Self {
        let phase = cycle.phase_at(height);
        let failed = phase.is_some_and(|p| p > CyclePhase::ClientChannelEstablishment)
            && status == PaymentStatus::Registered;
        Self {
            start: cycle.start,
            height,
            periods: cycle.periods(),
            phase,
            status,
            ascii_art: cycle.ascii_art(height),
            failed,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub height: Height,
    pub cycles: Vec<CycleProgressInfo>,
}

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("writing progress: {0}")]
    Io(#[from] io::Error),

    #[error("encoding progress: {0}")]
    Json(#[from] serde_json::Error),
}

/// Receives the snapshot produced after each processed block.
pub trait ProgressSink: Send + Sync + 'static {
    fn publish(&self, info: &ProgressInfo) -> Result<(), ProgressError>;
}

/// Writes each snapshot as pretty JSON, replacing the file atomically.
#[derive(Clone, Debug)]
pub struct JsonFileProgressSink {
    path: PathBuf,
}

impl JsonFileProgressSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProgressSink for JsonFileProgressSink {
    fn publish(&self, info: &ProgressInfo) -> Result<(), ProgressError> {
        let buf = serde_json::to_vec_pretty(info)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, buf)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
