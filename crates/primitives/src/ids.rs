//! Opaque identifiers.

use borsh::{BorshDeserialize, BorshSerialize};

/// SHA-256 commitment to a [`ProtocolParameters`](crate::ProtocolParameters) set.
///
/// Persisted sessions record the hash they were created under so that a
/// session negotiated with a different tumbler configuration is never resumed.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, BorshSerialize, BorshDeserialize)]
pub struct ParamsHash([u8; 32]);

impl_hex_id!(ParamsHash, 32);

/// Binds an escrow to one negotiated session with the tumbler.
#[derive(
    Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, BorshSerialize, BorshDeserialize,
)]
pub struct ChannelId([u8; 20]);

impl_hex_id!(ChannelId, 20);
