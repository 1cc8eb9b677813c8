//! Client configuration, loaded from TOML.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use bitcoin::{FeeRate, Network};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tumbler_batching::BatchConfig;
use tumbler_common::logging::{FileLoggingConfig, LoggerConfig};

use crate::services::ConfirmationTargets;

const DEFAULT_DATADIR: &str = "tumbler-data";
const DEFAULT_PROGRESS_FILE: &str = "progress.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] io::Error),

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Where the session database lives.
    #[serde(default = "default_datadir")]
    pub datadir: PathBuf,

    /// Progress snapshot, relative to `datadir` unless absolute.
    #[serde(default = "default_progress_file")]
    pub progress_file: PathBuf,

    #[serde(default = "default_network")]
    pub network: Network,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub batch: BatchSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            datadir: default_datadir(),
            progress_file: default_progress_file(),
            network: default_network(),
            executor: ExecutorConfig::default(),
            batch: BatchSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ex = &self.executor;
        if ex.propagation_delay_min_ms > ex.propagation_delay_max_ms {
            return Err(ConfigError::Invalid(format!(
                "propagation delay min {} exceeds max {}",
                ex.propagation_delay_min_ms, ex.propagation_delay_max_ms
            )));
        }
        self.batch.fee_rate()?;
        Ok(())
    }

    pub fn progress_path(&self) -> PathBuf {
        self.datadir.join(&self.progress_file)
    }

    pub fn db_path(&self) -> PathBuf {
        self.datadir.join("sessions")
    }
}

fn default_datadir() -> PathBuf {
    DEFAULT_DATADIR.into()
}

fn default_progress_file() -> PathBuf {
    DEFAULT_PROGRESS_FILE.into()
}

fn default_network() -> Network {
    Network::Bitcoin
}

/// Tuning of the per-block driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Lower bound of the random wait after a block, giving the tumbler time
    /// to see it too.
    pub propagation_delay_min_ms: u64,
    pub propagation_delay_max_ms: u64,

    /// Fixed wait used on regtest instead of the random one.
    pub regtest_delay_ms: u64,

    /// Sleep after an unexpected iteration failure.
    pub error_backoff_ms: u64,

    /// Consecutive invalid-phase failures tolerated before warning loudly.
    pub invalid_phase_warn_threshold: u32,

    pub client_escrow_confirmations: u32,
    pub tumbler_escrow_confirmations: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            propagation_delay_min_ms: 10_000,
            propagation_delay_max_ms: 60_000,
            regtest_delay_ms: 200,
            error_backoff_ms: 5_000,
            invalid_phase_warn_threshold: 2,
            client_escrow_confirmations: 1,
            tumbler_escrow_confirmations: 1,
        }
    }
}

impl ExecutorConfig {
    /// Wait applied after each new block before touching any cycle.
    pub fn propagation_delay(&self, network: Network) -> Duration {
        if network == Network::Regtest {
            return Duration::from_millis(self.regtest_delay_ms);
        }
        let lo = self.propagation_delay_min_ms;
        let hi = self.propagation_delay_max_ms.max(lo);
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn confirmation_targets(&self) -> ConfirmationTargets {
        ConfirmationTargets {
            client_escrow: self.client_escrow_confirmations,
            tumbler_escrow: self.tumbler_escrow_confirmations,
        }
    }
}

/// Settings shared by the funding and reclaim batches.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub interval_ms: u64,
    pub fee_rate_sat_vb: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            fee_rate_sat_vb: 10,
        }
    }
}

impl BatchSettings {
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            interval: Duration::from_millis(self.interval_ms),
        }
    }

    pub fn fee_rate(&self) -> Result<FeeRate, ConfigError> {
        FeeRate::from_sat_per_vb(self.fee_rate_sat_vb).ok_or_else(|| {
            ConfigError::Invalid(format!("fee rate {} sat/vB overflows", self.fee_rate_sat_vb))
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub service_name: String,
    /// Extra filter directives, e.g. `tumbler_client=debug`.
    pub filter: Option<String>,
    pub json: bool,
    /// Enables the rolling file layer when set.
    pub file_directory: Option<PathBuf>,
    pub file_name_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            service_name: "tumbler-client".to_owned(),
            filter: None,
            json: false,
            file_directory: None,
            file_name_prefix: "tumbler".to_owned(),
        }
    }
}

impl LoggingSettings {
    pub fn logger_config(&self) -> LoggerConfig {
        let mut config = LoggerConfig::new(self.service_name.clone()).with_json_logging(self.json);
        if let Some(filter) = &self.filter {
            config = config.with_filter(filter.clone());
        }
        if let Some(dir) = &self.file_directory {
            config = config.with_file_logging(
                FileLoggingConfig::new(dir.clone(), self.file_name_prefix.clone())
                    .with_json_format(self.json),
            );
        }
        config
    }
}
