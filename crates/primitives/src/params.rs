//! Tumbler protocol parameters and their commitment hash.

use bitcoin::{secp256k1::PublicKey, Amount, Network};
use borsh::BorshSerialize;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{errors::ParamsError, generator::OverlappedCycleGenerator, ids::ParamsHash};

/// Parameters announced by a tumbler server.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProtocolParameters {
    pub version: u32,
    pub network: Network,
    /// Amount every participant sends and receives.
    pub denomination: Amount,
    /// Fee paid to the tumbler on top of the denomination.
    pub fee: Amount,
    pub real_puzzle_count: u32,
    pub fake_puzzle_count: u32,
    pub real_transaction_count: u32,
    pub fake_transaction_count: u32,
    pub cycle_generator: OverlappedCycleGenerator,
    pub server_key: PublicKey,
}

/// Fixed-layout view of the parameters used for hashing.
#[derive(BorshSerialize)]
struct ParamsCommitment<'a> {
    version: u32,
    network_magic: [u8; 4],
    denomination_sat: u64,
    fee_sat: u64,
    real_puzzle_count: u32,
    fake_puzzle_count: u32,
    real_transaction_count: u32,
    fake_transaction_count: u32,
    cycle_generator: &'a OverlappedCycleGenerator,
    server_key: [u8; 33],
}

impl ProtocolParameters {
    pub fn validate(&self) -> Result<(), ParamsError> {
        self.cycle_generator.validate()?;
        self.denomination
            .checked_add(self.fee)
            .ok_or(ParamsError::AmountOverflow)?;
        Ok(())
    }

    /// Balance a client needs to take part in one cycle.
    pub fn funding_amount(&self) -> Amount {
        self.denomination
            .checked_add(self.fee)
            .unwrap_or(Amount::MAX)
    }

    /// SHA-256 over the borsh encoding of every field.
    pub fn hash(&self) -> ParamsHash {
        let commitment = ParamsCommitment {
            version: self.version,
            network_magic: self.network.magic().to_bytes(),
            denomination_sat: self.denomination.to_sat(),
            fee_sat: self.fee.to_sat(),
            real_puzzle_count: self.real_puzzle_count,
            fake_puzzle_count: self.fake_puzzle_count,
            real_transaction_count: self.real_transaction_count,
            fake_transaction_count: self.fake_transaction_count,
            cycle_generator: &self.cycle_generator,
            server_key: self.server_key.serialize(),
        };

        // Serializing into a Vec cannot fail.
        let buf = borsh::to_vec(&commitment).unwrap_or_default();
        ParamsHash::new(Sha256::digest(&buf).into())
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    use super::*;
    use crate::cycle::CycleParameters;

    fn params() -> ProtocolParameters {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let first = CycleParameters {
            start: 0,
            registration_duration: 6,
            client_channel_establishment_duration: 3,
            tumbler_channel_establishment_duration: 3,
            payment_phase_duration: 3,
            tumbler_cashout_duration: 4,
            client_cashout_duration: 6,
            safety_period_duration: 2,
        };
        ProtocolParameters {
            version: 2,
            network: Network::Regtest,
            denomination: Amount::from_btc(1.0).unwrap(),
            fee: Amount::from_sat(10_000),
            real_puzzle_count: 15,
            fake_puzzle_count: 285,
            real_transaction_count: 42,
            fake_transaction_count: 42,
            cycle_generator: OverlappedCycleGenerator::new(first, 1).unwrap(),
            server_key: PublicKey::from_secret_key(&secp, &sk),
        }
    }

    #[test]
    fn test_hash_is_stable() {
        let a = params();
        let b = params();
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_changes_with_any_field() {
        let base = params().hash();

        let mut p = params();
        p.fee = Amount::from_sat(10_001);
        assert_ne!(p.hash(), base);

        let mut p = params();
        p.network = Network::Testnet;
        assert_ne!(p.hash(), base);

        let mut p = params();
        p.fake_puzzle_count += 1;
        assert_ne!(p.hash(), base);
    }

    #[test]
    fn test_funding_amount() {
        let p = params();
        assert_eq!(
            p.funding_amount(),
            Amount::from_sat(100_000_000 + 10_000)
        );
        p.validate().unwrap();
    }

    #[test]
    fn test_serde_roundtrip_keeps_hash() {
        let p = params();
        let json = serde_json::to_string(&p).unwrap();
        let back: ProtocolParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hash(), p.hash());
    }
}
