//! Wallet-facing capabilities and the two batch kinds that spend through
//! them: escrow funding and escrow reclaiming.

mod errors;
mod fees;
mod funding;
mod reclaim;
mod traits;

pub use errors::WalletError;
pub use fees::{estimate_funding_vsize, estimate_reclaim_vsize, DUST_LIMIT, P2WPKH_INPUT_VBYTES};
pub use funding::{FundingBatch, FundingError, FundingRunner, Recipient};
pub use reclaim::{ReclaimBatch, ReclaimError, ReclaimRunner};
#[cfg(any(test, feature = "test-utils"))]
pub use traits::{MockBroadcaster, MockWalletClient};
pub use traits::{Broadcaster, SpendableCoin, WalletClient};
