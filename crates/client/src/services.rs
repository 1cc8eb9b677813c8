//! Collaborators a payment session calls out to.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bitcoin::Transaction;
use tumbler_batching::BatchError;
use tumbler_escrow::ClientEscapeData;
use tumbler_primitives::ProtocolParameters;
use tumbler_wallet::{
    Broadcaster, FundingBatch, FundingError, Recipient, ReclaimBatch, ReclaimError, WalletClient,
};

use crate::{chain::BlockExplorer, protocol::TumblerProtocolClient};

/// Funds an escrow output, possibly together with other escrows.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait EscrowFunder: Send + Sync + 'static {
    async fn fund(&self, recipient: Recipient) -> Result<Transaction, BatchError<FundingError>>;
}

/// Sweeps an escrow back into the wallet, possibly together with others.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait EscrowReclaimer: Send + Sync + 'static {
    async fn reclaim(
        &self,
        escape: ClientEscapeData,
    ) -> Result<Transaction, BatchError<ReclaimError>>;
}

#[async_trait]
impl<W: WalletClient, B: Broadcaster> EscrowFunder for FundingBatch<W, B> {
    async fn fund(&self, recipient: Recipient) -> Result<Transaction, BatchError<FundingError>> {
        self.submit(recipient).await
    }
}

#[async_trait]
impl<W: WalletClient, B: Broadcaster> EscrowReclaimer for ReclaimBatch<W, B> {
    async fn reclaim(
        &self,
        escape: ClientEscapeData,
    ) -> Result<Transaction, BatchError<ReclaimError>> {
        self.submit(escape).await
    }
}

/// Confirmation depths required before moving past an escrow.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ConfirmationTargets {
    pub client_escrow: u32,
    pub tumbler_escrow: u32,
}

/// Everything a [`PaymentStateMachine`](crate::PaymentStateMachine) needs to
/// advance.
#[derive(Clone)]
pub struct SessionServices {
    pub params: Arc<ProtocolParameters>,
    pub tumbler: Arc<dyn TumblerProtocolClient>,
    pub explorer: Arc<dyn BlockExplorer>,
    pub funder: Arc<dyn EscrowFunder>,
    pub reclaimer: Arc<dyn EscrowReclaimer>,
    pub confirmations: ConfirmationTargets,
}

impl fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionServices")
            .field("params", &self.params.hash())
            .field("confirmations", &self.confirmations)
            .finish_non_exhaustive()
    }
}
