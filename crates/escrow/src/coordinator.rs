use std::fmt;

use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use tracing::*;
use tumbler_primitives::ChannelId;

use crate::{
    errors::EscrowError,
    escape::ClientEscapeData,
    script::EscrowScriptParams,
    state::{EscrowState, EscrowedCoin},
};

/// Which side of the escrow script we hold the key for.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EscrowRole {
    /// Funds the escrow and can refund it after the lock time.
    Initiator,
    /// Receives the escrow through the cooperative branch.
    Receiver,
}

impl fmt::Display for EscrowRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EscrowRole::Initiator => "initiator",
            EscrowRole::Receiver => "receiver",
        })
    }
}

/// Owns the escrow state of one party for one cycle.
///
/// The state is only ever replaced as a whole through [`Self::configure`].
pub struct EscrowCoordinator {
    role: EscrowRole,
    state: Option<EscrowState>,
    params: Option<EscrowScriptParams>,
    secp: Secp256k1<All>,
}

impl fmt::Debug for EscrowCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscrowCoordinator")
            .field("role", &self.role)
            .field("channel_id", &self.channel_id())
            .field("outpoint", &self.state.as_ref().map(|s| s.coin.outpoint))
            .finish()
    }
}

impl EscrowCoordinator {
    pub fn new(role: EscrowRole) -> Self {
        Self {
            role,
            state: None,
            params: None,
            secp: Secp256k1::new(),
        }
    }

    /// Builds a coordinator already holding `state`.
    pub fn with_state(role: EscrowRole, state: EscrowState) -> Result<Self, EscrowError> {
        let mut coordinator = Self::new(role);
        coordinator.configure(state)?;
        Ok(coordinator)
    }

    pub fn role(&self) -> EscrowRole {
        self.role
    }

    /// Replaces the escrow state after checking that the key sits on our side
    /// of the redeem script.
    pub fn configure(&mut self, state: EscrowState) -> Result<(), EscrowError> {
        let params = state.coin.params()?;
        let ours = state.public_key(&self.secp);
        let expected = match self.role {
            EscrowRole::Initiator => params.initiator,
            EscrowRole::Receiver => params.receiver,
        };
        if ours != expected {
            return Err(EscrowError::KeyMismatch(match self.role {
                EscrowRole::Initiator => "initiator",
                EscrowRole::Receiver => "receiver",
            }));
        }

        debug!(
            role = %self.role,
            channel_id = %state.channel_id,
            outpoint = %state.coin.outpoint,
            "configured escrow"
        );
        self.params = Some(params);
        self.state = Some(state);
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&EscrowState> {
        self.state.as_ref()
    }

    pub fn into_state(self) -> Option<EscrowState> {
        self.state
    }

    pub fn coin(&self) -> Option<&EscrowedCoin> {
        self.state.as_ref().map(|s| &s.coin)
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.state.as_ref().map(|s| s.channel_id)
    }

    pub fn escrow_key(&self) -> Option<&SecretKey> {
        self.state.as_ref().map(|s| &s.key)
    }

    /// Our public key on the escrow.
    pub fn identity(&self) -> Option<PublicKey> {
        self.state.as_ref().map(|s| s.public_key(&self.secp))
    }

    pub fn counterparty_key(&self) -> Option<PublicKey> {
        self.params.map(|p| match self.role {
            EscrowRole::Initiator => p.receiver,
            EscrowRole::Receiver => p.initiator,
        })
    }

    pub fn lock_time(&self) -> Option<u32> {
        self.params.map(|p| p.lock_time.to_consensus_u32())
    }

    /// Bundles the escrow with the counterparty's escape signature so that it
    /// can be reclaimed.
    pub fn escape_data(
        &self,
        counterparty_signature: Vec<u8>,
    ) -> Result<ClientEscapeData, EscrowError> {
        let state = self.state.as_ref().ok_or(EscrowError::NotConfigured)?;
        Ok(ClientEscapeData {
            escrowed_coin: state.coin.clone(),
            counterparty_signature,
            escrow_key: state.key,
        })
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{hashes::Hash, OutPoint, Txid};

    use super::*;
    use crate::state::generate_escrow_key;

    fn coin(initiator: PublicKey, receiver: PublicKey) -> EscrowedCoin {
        let params = EscrowScriptParams::new(initiator, receiver, 150).unwrap();
        EscrowedCoin::new(
            OutPoint::new(Txid::all_zeros(), 1),
            bitcoin::Amount::from_sat(100_010_000),
            &params,
        )
    }

    #[test]
    fn test_unconfigured_has_no_identity() {
        let c = EscrowCoordinator::new(EscrowRole::Initiator);
        assert!(!c.is_configured());
        assert_eq!(c.identity(), None);
        assert_eq!(c.channel_id(), None);
        assert!(matches!(
            c.escape_data(vec![]),
            Err(EscrowError::NotConfigured)
        ));
    }

    #[test]
    fn test_configure_checks_role() {
        let secp = Secp256k1::new();
        let mine = generate_escrow_key();
        let theirs = generate_escrow_key();
        let my_pk = PublicKey::from_secret_key(&secp, &mine);
        let their_pk = PublicKey::from_secret_key(&secp, &theirs);

        let state = EscrowState {
            coin: coin(my_pk, their_pk),
            key: mine,
            channel_id: ChannelId::new([3; 20]),
        };

        let mut receiver = EscrowCoordinator::new(EscrowRole::Receiver);
        assert!(matches!(
            receiver.configure(state.clone()),
            Err(EscrowError::KeyMismatch("receiver"))
        ));
        assert!(!receiver.is_configured());

        let initiator = EscrowCoordinator::with_state(EscrowRole::Initiator, state).unwrap();
        assert_eq!(initiator.identity(), Some(my_pk));
        assert_eq!(initiator.counterparty_key(), Some(their_pk));
        assert_eq!(initiator.channel_id(), Some(ChannelId::new([3; 20])));
        assert_eq!(initiator.lock_time(), Some(150));
    }

    #[test]
    fn test_configure_replaces_whole_state() {
        let secp = Secp256k1::new();
        let other = PublicKey::from_secret_key(&secp, &generate_escrow_key());

        let first = generate_escrow_key();
        let second = generate_escrow_key();
        let mut c = EscrowCoordinator::new(EscrowRole::Receiver);

        c.configure(EscrowState {
            coin: coin(other, PublicKey::from_secret_key(&secp, &first)),
            key: first,
            channel_id: ChannelId::new([1; 20]),
        })
        .unwrap();
        c.configure(EscrowState {
            coin: coin(other, PublicKey::from_secret_key(&secp, &second)),
            key: second,
            channel_id: ChannelId::new([2; 20]),
        })
        .unwrap();

        assert_eq!(c.escrow_key(), Some(&second));
        assert_eq!(c.channel_id(), Some(ChannelId::new([2; 20])));
    }
}
