use async_trait::async_trait;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use serde::{Deserialize, Serialize};

use crate::errors::WalletError;

/// A wallet output that can be spent.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SpendableCoin {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    pub confirmations: u32,
}

impl SpendableCoin {
    pub fn amount(&self) -> Amount {
        self.txout.value
    }
}

/// Operations the tumbler client needs from the user's wallet.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait WalletClient: Send + Sync + 'static {
    /// Sum of coins with at least `min_confirmations` confirmations.
    async fn spendable_balance(&self, min_confirmations: u32) -> Result<Amount, WalletError>;

    async fn list_spendable(&self, min_confirmations: u32)
        -> Result<Vec<SpendableCoin>, WalletError>;

    /// Script to send change to.
    async fn change_script(&self) -> Result<ScriptBuf, WalletError>;

    /// Fresh, never used script to receive reclaimed funds on.
    async fn new_destination(&self) -> Result<ScriptBuf, WalletError>;

    /// Signs every input spending a wallet coin. `spent` lists the outputs
    /// spent by the inputs, in input order.
    async fn sign_transaction(
        &self,
        tx: Transaction,
        spent: Vec<TxOut>,
    ) -> Result<Transaction, WalletError>;
}

/// Publishes transactions to the network.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait Broadcaster: Send + Sync + 'static {
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, WalletError>;
}
