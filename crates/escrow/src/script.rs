use bitcoin::{
    absolute::LockTime,
    opcodes::{
        all::{
            OP_CHECKMULTISIG, OP_CHECKSIG, OP_CLTV, OP_DROP, OP_ELSE, OP_ENDIF, OP_IF, OP_PUSHNUM_2,
        },
        Opcode,
    },
    script::{Builder, Instruction},
    secp256k1::PublicKey,
    Script, ScriptBuf,
};
use serde::{Deserialize, Serialize};
use tumbler_primitives::Height;

use crate::errors::EscrowError;

/// Keys and refund height of one escrow.
///
/// The output is spendable by both parties together at any time, or by the
/// initiator alone once `lock_time` has passed:
///
/// ```text
/// OP_IF
///     2 <initiator> <receiver> 2 OP_CHECKMULTISIG
/// OP_ELSE
///     <lock_time> OP_CHECKLOCKTIMEVERIFY OP_DROP <initiator> OP_CHECKSIG
/// OP_ENDIF
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EscrowScriptParams {
    pub initiator: PublicKey,
    pub receiver: PublicKey,
    pub lock_time: LockTime,
}

impl EscrowScriptParams {
    pub fn new(
        initiator: PublicKey,
        receiver: PublicKey,
        lock_height: Height,
    ) -> Result<Self, EscrowError> {
        let lock_time =
            LockTime::from_height(lock_height)
                .map_err(|_| EscrowError::InvalidLockTime(lock_height))?;
        Ok(Self {
            initiator,
            receiver,
            lock_time,
        })
    }

    pub fn redeem_script(&self) -> ScriptBuf {
        let initiator = bitcoin::PublicKey::new(self.initiator);
        let receiver = bitcoin::PublicKey::new(self.receiver);
        Builder::new()
            .push_opcode(OP_IF)
            .push_int(2)
            .push_key(&initiator)
            .push_key(&receiver)
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_ELSE)
            .push_lock_time(self.lock_time)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_key(&initiator)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
            .into_script()
    }

    /// P2WSH output script committing to [`Self::redeem_script`].
    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2wsh(&self.redeem_script().wscript_hash())
    }

    /// Recovers the parameters from a redeem script built by
    /// [`Self::redeem_script`].
    pub fn from_redeem_script(script: &Script) -> Result<Self, EscrowError> {
        let ins = script
            .instructions()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| EscrowError::MalformedScript)?;
        if ins.len() != 13 {
            return Err(EscrowError::MalformedScript);
        }

        let is_op =
            |i: usize, expected: Opcode| matches!(ins[i], Instruction::Op(op) if op == expected);
        let key_at = |i: usize| match ins[i] {
            Instruction::PushBytes(bytes) => PublicKey::from_slice(bytes.as_bytes()).ok(),
            Instruction::Op(_) => None,
        };

        let shape_ok = is_op(0, OP_IF)
            && is_op(1, OP_PUSHNUM_2)
            && is_op(4, OP_PUSHNUM_2)
            && is_op(5, OP_CHECKMULTISIG)
            && is_op(6, OP_ELSE)
            && is_op(8, OP_CLTV)
            && is_op(9, OP_DROP)
            && is_op(11, OP_CHECKSIG)
            && is_op(12, OP_ENDIF);
        if !shape_ok {
            return Err(EscrowError::MalformedScript);
        }

        let initiator = key_at(2).ok_or(EscrowError::MalformedScript)?;
        let receiver = key_at(3).ok_or(EscrowError::MalformedScript)?;
        if key_at(10) != Some(initiator) {
            return Err(EscrowError::MalformedScript);
        }

        let lock_height = ins[7]
            .script_num()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(EscrowError::MalformedScript)?;
        let params = Self::new(initiator, receiver, lock_height)?;

        // Reject non-canonical encodings that would hash differently.
        if params.redeem_script().as_script() != script {
            return Err(EscrowError::MalformedScript);
        }
        Ok(params)
    }
}
