//! Contract of the tumbler server as seen by the client.

use async_trait::async_trait;
use bitcoin::{secp256k1::PublicKey, OutPoint};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tumbler_escrow::EscrowedCoin;
use tumbler_primitives::{ChannelId, Height};

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The anonymizing transport circuit to the tumbler is not ready yet.
    #[error("transport circuit to the tumbler is not ready")]
    PrematureRequest,

    /// The tumbler thinks the cycle is in another phase.
    #[error("tumbler is in a different phase: {0}")]
    InvalidPhase(String),

    /// The tumbler refused to continue this session.
    #[error("tumbler rejected the request: {0}")]
    Rejected(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),
}

/// Answer to a registration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub channel_id: ChannelId,
    /// Blinded voucher the tumbler will sign once our escrow confirms.
    #[serde(with = "hex::serde")]
    pub unsigned_voucher: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SignVoucherRequest {
    pub cycle_start: Height,
    pub channel_id: ChannelId,
    #[serde(with = "hex::serde")]
    pub unsigned_voucher: Vec<u8>,
    pub client_escrow: EscrowedCoin,
    pub client_escrow_key: PublicKey,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    pub cycle_start: Height,
    #[serde(with = "hex::serde")]
    pub signed_voucher: Vec<u8>,
    /// Our key on the escrow the tumbler funds.
    pub receiver_key: PublicKey,
}

/// Escrow the tumbler funded towards us.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TumblerEscrowOffer {
    pub channel_id: ChannelId,
    pub escrow: EscrowedCoin,
}

/// Client side of the tumbler protocol, one call per step.
///
/// Signatures are DER encoded with the sighash byte appended.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait TumblerProtocolClient: Send + Sync + 'static {
    async fn register(&self, cycle_start: Height) -> Result<Registration, ProtocolError>;

    /// Key the tumbler will use as receiver of our escrow.
    async fn request_tumbler_escrow_key(
        &self,
        cycle_start: Height,
        channel_id: ChannelId,
    ) -> Result<PublicKey, ProtocolError>;

    async fn sign_voucher(&self, request: SignVoucherRequest) -> Result<Vec<u8>, ProtocolError>;

    async fn open_tumbler_channel(
        &self,
        request: OpenChannelRequest,
    ) -> Result<TumblerEscrowOffer, ProtocolError>;

    /// Pays through the puzzle exchange and returns the tumbler's escape
    /// signature on the escrow it funded.
    async fn exchange_payment(
        &self,
        cycle_start: Height,
        channel_id: ChannelId,
    ) -> Result<Vec<u8>, ProtocolError>;

    /// Asks the tumbler to release our own escrow back to us.
    async fn request_escape(
        &self,
        cycle_start: Height,
        channel_id: ChannelId,
        escrow: OutPoint,
    ) -> Result<Vec<u8>, ProtocolError>;
}
