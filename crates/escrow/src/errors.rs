use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EscrowError {
    #[error("redeem script is not an escrow script")]
    MalformedScript,

    #[error("escrow key does not match the {0} key of the escrow script")]
    KeyMismatch(&'static str),

    #[error("escrow coordinator is not configured")]
    NotConfigured,

    #[error("invalid lock time {0}")]
    InvalidLockTime(u32),

    #[error("invalid signature encoding: {0}")]
    SignatureEncoding(String),

    #[error("signature does not verify")]
    BadSignature,

    #[error("sighash: {0}")]
    Sighash(String),
}
