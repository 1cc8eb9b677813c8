use thiserror::Error;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("partition name must not contain NUL bytes: {0:?}")]
    InvalidPartition(String),

    #[error("malformed key in store")]
    MalformedKey,

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("sled: {0}")]
    Sled(#[from] sled::Error),

    #[error("{0}")]
    Other(String),
}

impl DbError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
