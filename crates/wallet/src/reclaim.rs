//! Sweeps escrows we were handed escape signatures for into one fresh wallet
//! output.

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{
    absolute::LockTime,
    secp256k1::{All, Secp256k1},
    transaction::Version,
    Amount, FeeRate, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use thiserror::Error;
use tracing::*;
use tumbler_batching::{Batch, BatchRunner};
use tumbler_escrow::{ClientEscapeData, EscrowError, EscrowedCoin};

use crate::{
    errors::WalletError,
    fees::{estimate_reclaim_vsize, DUST_LIMIT},
    traits::{Broadcaster, WalletClient},
};

#[derive(Debug, Error)]
pub enum ReclaimError {
    #[error("reclaimed output of {0} would be dust")]
    DustOutput(Amount),

    #[error("fee computation overflowed")]
    FeeOverflow,

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error(transparent)]
    Wallet(#[from] WalletError),
}

/// Signing again only changes our own signatures, whose length varies by a
/// byte at most, so the size settles after one or two rounds.
const MAX_SIGNING_ROUNDS: usize = 4;

pub type ReclaimBatch<W, B> = Batch<ClientEscapeData, ReclaimRunner<W, B>>;

#[derive(Debug)]
pub struct ReclaimRunner<W, B> {
    wallet: Arc<W>,
    broadcaster: Arc<B>,
    fee_rate: FeeRate,
    secp: Secp256k1<All>,
}

impl<W: WalletClient, B: Broadcaster> ReclaimRunner<W, B> {
    pub fn new(wallet: Arc<W>, broadcaster: Arc<B>, fee_rate: FeeRate) -> Self {
        Self {
            wallet,
            broadcaster,
            fee_rate,
            secp: Secp256k1::new(),
        }
    }

    fn sign_all(
        &self,
        tx: &mut Transaction,
        escapes: &[ClientEscapeData],
    ) -> Result<(), EscrowError> {
        let witnesses = escapes
            .iter()
            .enumerate()
            .map(|(idx, e)| e.finalize_input(&self.secp, tx, idx))
            .collect::<Result<Vec<_>, _>>()?;
        for (input, witness) in tx.input.iter_mut().zip(witnesses) {
            input.witness = witness;
        }
        Ok(())
    }

    /// Value left for the destination once `fee` is paid. The prepaid part
    /// of the escrows covers the fee first and is never returned.
    fn net_value(total: Amount, prepaid: Amount, fee: Amount) -> Amount {
        total.checked_sub(fee.max(prepaid)).unwrap_or(Amount::ZERO)
    }
}

#[async_trait]
impl<W: WalletClient, B: Broadcaster> BatchRunner<ClientEscapeData> for ReclaimRunner<W, B> {
    type Output = Transaction;
    type Error = ReclaimError;

    fn name(&self) -> &'static str {
        "reclaim"
    }

    async fn run(&self, escapes: Vec<ClientEscapeData>) -> Result<Transaction, ReclaimError> {
        // rejects foreign scripts before anything touches the wallet
        for escape in &escapes {
            escape.escrowed_coin.params()?;
        }

        let destination = self.wallet.new_destination().await?;
        let total = escapes
            .iter()
            .try_fold(Amount::ZERO, |acc, e| acc.checked_add(e.escrowed_coin.amount))
            .ok_or(ReclaimError::FeeOverflow)?;

        // must match the template the escape signatures were made over
        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: escapes
                .iter()
                .map(|e| TxIn {
                    previous_output: e.escrowed_coin.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![TxOut {
                value: total,
                script_pubkey: destination,
            }],
        };

        let prepaid = escapes
            .iter()
            .try_fold(Amount::ZERO, |acc, e| acc.checked_add(e.escrowed_coin.prepaid_fee))
            .ok_or(ReclaimError::FeeOverflow)?;

        // Price the worst case first, then reprice on the signed size. The
        // output value does not affect the size and the counterparty
        // signatures commit to no outputs.
        let coins: Vec<&EscrowedCoin> = escapes.iter().map(|e| &e.escrowed_coin).collect();
        let mut vsize = estimate_reclaim_vsize(&tx, &coins);
        for round in 1..=MAX_SIGNING_ROUNDS {
            let fee = self.fee_rate.fee_vb(vsize).ok_or(ReclaimError::FeeOverflow)?;
            let value = Self::net_value(total, prepaid, fee);
            if value < DUST_LIMIT {
                return Err(ReclaimError::DustOutput(value));
            }
            tx.output[0].value = value;
            self.sign_all(&mut tx, &escapes)?;

            let actual = tx.vsize() as u64;
            trace!(%round, priced = vsize, %actual, %fee, %prepaid, "signed reclaim transaction");
            if actual == vsize {
                break;
            }
            vsize = actual;
        }

        let txid = self.broadcaster.broadcast(&tx).await?;
        info!(
            %txid,
            escrows = escapes.len(),
            value = %tx.output[0].value,
            "broadcast reclaim transaction"
        );
        Ok(tx)
    }
}
