//! Two-party escrow outputs: script construction, per-cycle escrow state and
//! the signatures needed to spend an escrow cooperatively.

mod coordinator;
mod errors;
mod escape;
mod script;
mod state;

pub use coordinator::{EscrowCoordinator, EscrowRole};
pub use errors::EscrowError;
pub use escape::{
    cooperative_witness, escape_template, sign_escape, sign_escrow_input, verify_escape_signature,
    ClientEscapeData, ESCAPE_SIGHASH,
};
pub use script::EscrowScriptParams;
pub use state::{generate_escrow_key, EscrowState, EscrowedCoin};
