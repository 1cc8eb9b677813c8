//! Cycle, phase and protocol parameter types shared by the tumbler client crates.

#[macro_use]
mod macros;

pub mod cycle;
pub mod errors;
pub mod generator;
pub mod ids;
pub mod params;

pub use cycle::{CycleParameters, CyclePeriod, CyclePeriods, CyclePhase, Height};
pub use errors::ParamsError;
pub use generator::OverlappedCycleGenerator;
pub use ids::{ChannelId, ParamsHash};
pub use params::ProtocolParameters;
