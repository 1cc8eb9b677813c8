//! Size estimates used to price batch transactions before they are signed.

use bitcoin::{consensus::serialize, Amount, Transaction, TxOut, Witness};
use tumbler_escrow::EscrowedCoin;

/// Outputs below this value are not relayed.
pub const DUST_LIMIT: Amount = Amount::from_sat(546);

/// Virtual size of a signed P2WPKH input.
pub const P2WPKH_INPUT_VBYTES: u64 = 68;

/// Version, lock time, input and output counts, segwit marker and flag.
const TX_OVERHEAD_VBYTES: u64 = 11;

/// Largest DER signature plus sighash byte.
const MAX_SIG_LEN: usize = 73;

/// Virtual size of a funding transaction with `inputs` wallet inputs.
pub fn estimate_funding_vsize(inputs: usize, outputs: &[TxOut]) -> u64 {
    let outputs_len: usize = outputs.iter().map(|o| serialize(o).len()).sum();
    TX_OVERHEAD_VBYTES + inputs as u64 * P2WPKH_INPUT_VBYTES + outputs_len as u64
}

/// Virtual size of `tx` once every input, spending the matching entry of
/// `coins`, carries a cooperative escrow witness.
pub fn estimate_reclaim_vsize(tx: &Transaction, coins: &[&EscrowedCoin]) -> u64 {
    let mut sized = tx.clone();
    for (input, coin) in sized.input.iter_mut().zip(coins) {
        let mut witness = Witness::new();
        witness.push(Vec::<u8>::new());
        witness.push([0u8; MAX_SIG_LEN]);
        witness.push([0u8; MAX_SIG_LEN]);
        witness.push([1u8]);
        witness.push(coin.redeem_script.as_bytes());
        input.witness = witness;
    }
    sized.vsize() as u64
}
