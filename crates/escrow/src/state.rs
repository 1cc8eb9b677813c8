use bitcoin::{
    secp256k1::{PublicKey, Secp256k1, SecretKey, Signing},
    Amount, OutPoint, ScriptBuf, TxOut,
};
use serde::{Deserialize, Serialize};
use tumbler_primitives::ChannelId;

use crate::{errors::EscrowError, script::EscrowScriptParams};

/// An on-chain escrow output together with its redeem script.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EscrowedCoin {
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub redeem_script: ScriptBuf,
    /// Part of `amount` already set aside for the fee of the spending
    /// transaction.
    #[serde(default)]
    pub prepaid_fee: Amount,
}

impl EscrowedCoin {
    pub fn new(outpoint: OutPoint, amount: Amount, params: &EscrowScriptParams) -> Self {
        Self {
            outpoint,
            amount,
            redeem_script: params.redeem_script(),
            prepaid_fee: Amount::ZERO,
        }
    }

    pub fn with_prepaid_fee(mut self, fee: Amount) -> Self {
        self.prepaid_fee = fee;
        self
    }

    pub fn params(&self) -> Result<EscrowScriptParams, EscrowError> {
        EscrowScriptParams::from_redeem_script(&self.redeem_script)
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2wsh(&self.redeem_script.wscript_hash())
    }

    /// The output being spent, as needed for sighash computation.
    pub fn txout(&self) -> TxOut {
        TxOut {
            value: self.amount,
            script_pubkey: self.script_pubkey(),
        }
    }
}

/// One party's view of one escrow: the coin, our key on it and the channel
/// the escrow was negotiated in.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EscrowState {
    pub coin: EscrowedCoin,
    pub key: SecretKey,
    pub channel_id: ChannelId,
}

impl EscrowState {
    pub fn public_key<C: Signing>(&self, secp: &Secp256k1<C>) -> PublicKey {
        PublicKey::from_secret_key(secp, &self.key)
    }
}

/// Fresh random escrow key.
pub fn generate_escrow_key() -> SecretKey {
    SecretKey::new(&mut rand::thread_rng())
}
