//! Cooperative spending of escrows.
//!
//! The counterparty hands over a `SIGHASH_NONE|ANYONECANPAY` signature on the
//! escrow input. It commits only to the input itself, so we are free to pick
//! the outputs and to batch the input with other escrows. Our own signature
//! commits to the whole transaction with `SIGHASH_ALL`.

use bitcoin::{
    absolute::LockTime,
    ecdsa,
    hashes::Hash,
    secp256k1::{Message, PublicKey, Secp256k1, SecretKey, Signing, Verification},
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    ScriptBuf, Sequence, Transaction, TxIn, Witness,
};
use serde::{Deserialize, Serialize};

use crate::{errors::EscrowError, state::EscrowedCoin};

/// Sighash type of signatures handed over by the counterparty.
pub const ESCAPE_SIGHASH: EcdsaSighashType = EcdsaSighashType::NonePlusAnyoneCanPay;

/// Everything needed to reclaim one escrow through the cooperative branch.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientEscapeData {
    pub escrowed_coin: EscrowedCoin,
    /// DER signature with sighash byte, as received from the counterparty.
    #[serde(with = "hex::serde")]
    pub counterparty_signature: Vec<u8>,
    /// Our key on the escrow.
    pub escrow_key: SecretKey,
}

impl ClientEscapeData {
    pub fn counterparty_signature(&self) -> Result<ecdsa::Signature, EscrowError> {
        ecdsa::Signature::from_slice(&self.counterparty_signature)
            .map_err(|e| EscrowError::SignatureEncoding(e.to_string()))
    }

    /// Signs input `input_index` of `tx`, which must spend this escrow, and
    /// returns the complete witness.
    pub fn finalize_input<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        tx: &Transaction,
        input_index: usize,
    ) -> Result<Witness, EscrowError> {
        let params = self.escrowed_coin.params()?;
        let ours = sign_escrow_input(
            secp,
            tx,
            input_index,
            &self.escrowed_coin,
            &self.escrow_key,
            EcdsaSighashType::All,
        )?;
        let theirs = self.counterparty_signature()?;

        let our_pk = PublicKey::from_secret_key(secp, &self.escrow_key);
        let (initiator_sig, receiver_sig) = if our_pk == params.initiator {
            (ours, theirs)
        } else if our_pk == params.receiver {
            (theirs, ours)
        } else {
            return Err(EscrowError::KeyMismatch("either"));
        };

        Ok(cooperative_witness(
            &self.escrowed_coin.redeem_script,
            &initiator_sig,
            &receiver_sig,
        ))
    }
}

/// Single-input transaction the escape signature is computed over.
///
/// Version, lock time and sequence are committed to even under
/// `SIGHASH_NONE|ANYONECANPAY`, so any transaction that reuses the signature
/// must match them.
pub fn escape_template(coin: &EscrowedCoin) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: coin.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: Vec::new(),
    }
}

fn escrow_sighash(
    tx: &Transaction,
    input_index: usize,
    coin: &EscrowedCoin,
    sighash_type: EcdsaSighashType,
) -> Result<Message, EscrowError> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wsh_signature_hash(input_index, &coin.redeem_script, coin.amount, sighash_type)
        .map_err(|e| EscrowError::Sighash(e.to_string()))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

pub fn sign_escrow_input<C: Signing>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    input_index: usize,
    coin: &EscrowedCoin,
    key: &SecretKey,
    sighash_type: EcdsaSighashType,
) -> Result<ecdsa::Signature, EscrowError> {
    let msg = escrow_sighash(tx, input_index, coin, sighash_type)?;
    Ok(ecdsa::Signature {
        signature: secp.sign_ecdsa_low_r(&msg, key),
        sighash_type,
    })
}

/// Produces the signature a counterparty hands over for an escrow.
pub fn sign_escape<C: Signing>(
    secp: &Secp256k1<C>,
    coin: &EscrowedCoin,
    key: &SecretKey,
) -> Result<ecdsa::Signature, EscrowError> {
    sign_escrow_input(secp, &escape_template(coin), 0, coin, key, ESCAPE_SIGHASH)
}

/// Checks a counterparty escape signature on `coin` against `signer`.
pub fn verify_escape_signature<C: Verification>(
    secp: &Secp256k1<C>,
    coin: &EscrowedCoin,
    signer: &PublicKey,
    signature: &[u8],
) -> Result<(), EscrowError> {
    let sig = ecdsa::Signature::from_slice(signature)
        .map_err(|e| EscrowError::SignatureEncoding(e.to_string()))?;
    if sig.sighash_type != ESCAPE_SIGHASH {
        return Err(EscrowError::BadSignature);
    }

    let msg = escrow_sighash(&escape_template(coin), 0, coin, ESCAPE_SIGHASH)?;
    secp.verify_ecdsa(&msg, &sig.signature, signer)
        .map_err(|_| EscrowError::BadSignature)
}

/// Witness for the `OP_IF` branch: `[<>, sig_initiator, sig_receiver, 0x01,
/// redeem_script]`.
pub fn cooperative_witness(
    redeem_script: &ScriptBuf,
    initiator_sig: &ecdsa::Signature,
    receiver_sig: &ecdsa::Signature,
) -> Witness {
    let mut witness = Witness::new();
    // CHECKMULTISIG pops one extra element
    witness.push(Vec::<u8>::new());
    witness.push(initiator_sig.to_vec());
    witness.push(receiver_sig.to_vec());
    witness.push([1u8]);
    witness.push(redeem_script.as_bytes());
    witness
}
