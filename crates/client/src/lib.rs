//! Tumbling client core: per-cycle payment sessions and the executor that
//! advances them on every new block.

pub mod chain;
pub mod config;
pub mod executor;
pub mod progress;
pub mod protocol;
pub mod services;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use chain::{
    BlockExplorer, BlockRef, ChainError, ChainOracle, ChainTipSource, PollingChainOracle,
};
pub use config::{BatchSettings, ClientConfig, ConfigError, ExecutorConfig, LoggingSettings};
pub use executor::{
    ExecutorContext, ExecutorHandle, InvalidPhaseTracker, LoopState, StateMachineExecutor,
};
pub use progress::{
    CycleProgressInfo, JsonFileProgressSink, ProgressError, ProgressInfo, ProgressSink,
};
pub use protocol::{ProtocolError, TumblerProtocolClient};
pub use services::{ConfirmationTargets, EscrowFunder, EscrowReclaimer, SessionServices};
pub use session::{
    CompletionKind, FailureKind, PaymentError, PaymentSessionRecord, PaymentStateMachine,
    PaymentStatus, SessionState,
};
pub use store::CycleStore;
