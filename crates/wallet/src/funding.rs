//! Funds many escrows with one wallet transaction.

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{
    absolute::LockTime, transaction::Version, Amount, FeeRate, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Witness,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::*;
use tumbler_batching::{Batch, BatchRunner};

use crate::{
    errors::WalletError,
    fees::{estimate_funding_vsize, DUST_LIMIT},
    traits::{Broadcaster, SpendableCoin, WalletClient},
};

/// One payment request: send `amount` to `script_pubkey`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub script_pubkey: ScriptBuf,
    pub amount: Amount,
}

impl Recipient {
    pub fn txout(&self) -> TxOut {
        TxOut {
            value: self.amount,
            script_pubkey: self.script_pubkey.clone(),
        }
    }

    /// Finds the output paying this recipient in `tx`.
    pub fn locate(&self, tx: &Transaction) -> Option<OutPoint> {
        let txid = tx.compute_txid();
        tx.output
            .iter()
            .position(|o| o.script_pubkey == self.script_pubkey && o.value == self.amount)
            .map(|vout| OutPoint::new(txid, vout as u32))
    }
}

#[derive(Debug, Error)]
pub enum FundingError {
    #[error("insufficient funds, missing {missing}")]
    InsufficientFunds { missing: Amount },

    #[error("fee computation overflowed")]
    FeeOverflow,

    #[error(transparent)]
    Wallet(#[from] WalletError),
}

pub type FundingBatch<W, B> = Batch<Recipient, FundingRunner<W, B>>;

/// Builds, signs and broadcasts one transaction paying every recipient of a
/// batch window.
#[derive(Debug)]
pub struct FundingRunner<W, B> {
    wallet: Arc<W>,
    broadcaster: Arc<B>,
    fee_rate: FeeRate,
    min_confirmations: u32,
}

impl<W: WalletClient, B: Broadcaster> FundingRunner<W, B> {
    pub fn new(wallet: Arc<W>, broadcaster: Arc<B>, fee_rate: FeeRate) -> Self {
        Self {
            wallet,
            broadcaster,
            fee_rate,
            min_confirmations: 1,
        }
    }

    fn fee(&self, inputs: usize, outputs: &[TxOut]) -> Result<Amount, FundingError> {
        self.fee_rate
            .fee_vb(estimate_funding_vsize(inputs, outputs))
            .ok_or(FundingError::FeeOverflow)
    }

    /// Picks coins largest first and decides whether a change output is
    /// worth adding. Returns the chosen coins and the change amount.
    fn select(
        &self,
        mut coins: Vec<SpendableCoin>,
        outputs: &[TxOut],
        change: &TxOut,
    ) -> Result<(Vec<SpendableCoin>, Option<Amount>), FundingError> {
        let target = outputs
            .iter()
            .try_fold(Amount::ZERO, |acc, o| acc.checked_add(o.value))
            .ok_or(FundingError::FeeOverflow)?;

        let mut with_change = outputs.to_vec();
        with_change.push(change.clone());

        coins.sort_by(|a, b| b.amount().cmp(&a.amount()));

        let mut sum = Amount::ZERO;
        for n in 1..=coins.len() {
            sum += coins[n - 1].amount();

            let fee_with_change = self.fee(n, &with_change)?;
            if let Some(rest) = sum.checked_sub(target + fee_with_change) {
                if rest >= DUST_LIMIT {
                    coins.truncate(n);
                    return Ok((coins, Some(rest)));
                }
            }

            let fee = self.fee(n, outputs)?;
            if sum >= target + fee {
                coins.truncate(n);
                return Ok((coins, None));
            }
        }

        let fee = self.fee(coins.len(), outputs)?;
        let needed = target + fee;
        Err(FundingError::InsufficientFunds {
            missing: needed - sum,
        })
    }
}

#[async_trait]
impl<W: WalletClient, B: Broadcaster> BatchRunner<Recipient> for FundingRunner<W, B> {
    type Output = Transaction;
    type Error = FundingError;

    fn name(&self) -> &'static str {
        "funding"
    }

    async fn run(&self, recipients: Vec<Recipient>) -> Result<Transaction, FundingError> {
        let coins = self.wallet.list_spendable(self.min_confirmations).await?;
        let change_script = self.wallet.change_script().await?;

        let mut outputs: Vec<TxOut> = recipients.iter().map(Recipient::txout).collect();
        let change_out = TxOut {
            value: Amount::ZERO,
            script_pubkey: change_script,
        };
        let (chosen, change) = self.select(coins, &outputs, &change_out)?;

        if let Some(value) = change {
            let pos = rand::thread_rng().gen_range(0..=outputs.len());
            outputs.insert(
                pos,
                TxOut {
                    value,
                    ..change_out
                },
            );
        }

        let spent: Vec<TxOut> = chosen.iter().map(|c| c.txout.clone()).collect();
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: chosen
                .iter()
                .map(|c| TxIn {
                    previous_output: c.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs,
        };

        let signed = self.wallet.sign_transaction(tx, spent).await?;
        let txid = self.broadcaster.broadcast(&signed).await?;
        info!(
            %txid,
            recipients = recipients.len(),
            inputs = signed.input.len(),
            "broadcast funding transaction"
        );
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{hashes::Hash, Txid};
    use mockall::predicate::*;

    use super::*;
    use crate::traits::{MockBroadcaster, MockWalletClient};

    fn p2wsh(tag: u8) -> ScriptBuf {
        ScriptBuf::new_p2wsh(&ScriptBuf::from_bytes(vec![tag]).wscript_hash())
    }

    fn coin(vout: u32, sat: u64) -> SpendableCoin {
        SpendableCoin {
            outpoint: OutPoint::new(Txid::all_zeros(), vout),
            txout: TxOut {
                value: Amount::from_sat(sat),
                script_pubkey: p2wsh(0xaa),
            },
            confirmations: 3,
        }
    }

    fn runner(
        wallet: MockWalletClient,
        broadcaster: MockBroadcaster,
    ) -> FundingRunner<MockWalletClient, MockBroadcaster> {
        FundingRunner::new(
            Arc::new(wallet),
            Arc::new(broadcaster),
            FeeRate::from_sat_per_vb(70).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_shortfall_reports_missing_amount() {
        let mut wallet = MockWalletClient::new();
        wallet
            .expect_list_spendable()
            .with(eq(1))
            .returning(|_| Ok(vec![coin(0, 100_000_000)]));
        wallet
            .expect_change_script()
            .returning(|| Ok(p2wsh(0xcc)));
        let mut broadcaster = MockBroadcaster::new();
        broadcaster.expect_broadcast().never();

        let recipients = vec![
            Recipient {
                script_pubkey: p2wsh(1),
                amount: Amount::from_sat(100_000_000),
            },
            Recipient {
                script_pubkey: p2wsh(2),
                amount: Amount::from_sat(50_000_000),
            },
        ];
        let outputs: Vec<_> = recipients.iter().map(Recipient::txout).collect();
        let runner = runner(wallet, broadcaster);
        let expected_fee = runner.fee(1, &outputs).unwrap();

        let err = runner.run(recipients).await.unwrap_err();
        let FundingError::InsufficientFunds { missing } = err else {
            panic!("unexpected error {err:?}");
        };
        // half a coin plus the fee of spending the only coin
        assert_eq!(missing, Amount::from_sat(50_000_000) + expected_fee);
    }

    #[tokio::test]
    async fn test_pays_all_recipients_with_change() {
        let mut wallet = MockWalletClient::new();
        wallet
            .expect_list_spendable()
            .returning(|_| Ok(vec![coin(0, 30_000), coin(1, 500_000), coin(2, 200_000)]));
        wallet
            .expect_change_script()
            .returning(|| Ok(p2wsh(0xcc)));
        wallet
            .expect_sign_transaction()
            .times(1)
            .returning(|tx, spent| {
                assert_eq!(tx.input.len(), spent.len());
                Ok(tx)
            });
        let mut broadcaster = MockBroadcaster::new();
        broadcaster
            .expect_broadcast()
            .times(1)
            .returning(|tx| Ok(tx.compute_txid()));

        let recipients = vec![
            Recipient {
                script_pubkey: p2wsh(1),
                amount: Amount::from_sat(300_000),
            },
            Recipient {
                script_pubkey: p2wsh(2),
                amount: Amount::from_sat(100_000),
            },
        ];
        let tx = runner(wallet, broadcaster)
            .run(recipients.clone())
            .await
            .unwrap();

        // largest coin alone covers 400k plus fee
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].previous_output.vout, 1);
        assert_eq!(tx.output.len(), 3);
        for r in &recipients {
            assert!(r.locate(&tx).is_some());
        }

        let change = tx
            .output
            .iter()
            .find(|o| o.script_pubkey == p2wsh(0xcc))
            .unwrap();
        let fee = Amount::from_sat(500_000) - Amount::from_sat(400_000) - change.value;
        let with_change: Vec<_> = tx.output.clone();
        assert_eq!(
            fee,
            FeeRate::from_sat_per_vb(70)
                .unwrap()
                .fee_vb(estimate_funding_vsize(1, &with_change))
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_skips_dust_change() {
        let recipient = Recipient {
            script_pubkey: p2wsh(1),
            amount: Amount::from_sat(100_000),
        };
        let fee_rate = FeeRate::from_sat_per_vb(70).unwrap();
        let no_change_fee = fee_rate
            .fee_vb(estimate_funding_vsize(1, &[recipient.txout()]))
            .unwrap();
        // leftover above the no-change fee but far below dust
        let coin_value = 100_000 + no_change_fee.to_sat() + 100;

        let mut wallet = MockWalletClient::new();
        wallet
            .expect_list_spendable()
            .returning(move |_| Ok(vec![coin(0, coin_value)]));
        wallet
            .expect_change_script()
            .returning(|| Ok(p2wsh(0xcc)));
        wallet
            .expect_sign_transaction()
            .returning(|tx, _| Ok(tx));
        let mut broadcaster = MockBroadcaster::new();
        broadcaster
            .expect_broadcast()
            .returning(|tx| Ok(tx.compute_txid()));

        let tx = runner(wallet, broadcaster).run(vec![recipient]).await.unwrap();
        assert_eq!(tx.output.len(), 1);
    }
}
