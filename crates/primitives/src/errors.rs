//! Errors raised while validating protocol parameters.

use thiserror::Error;

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParamsError {
    #[error("registration overlap {overlap} must be smaller than registration duration {registration}")]
    OverlapTooLarge { overlap: u32, registration: u32 },

    #[error("cycle phase '{0}' has zero duration")]
    EmptyPhase(&'static str),

    #[error("cycle starting at {0} ends past the maximum block height")]
    HeightOverflow(u32),

    #[error("denomination plus fee overflows")]
    AmountOverflow,
}
