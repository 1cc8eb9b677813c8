use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet backend: {0}")]
    Backend(String),

    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

impl WalletError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}
