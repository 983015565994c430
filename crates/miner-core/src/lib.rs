//! Shared building blocks for `hds-miner`: difficulty targets, solution
//! encodings, nonce layout, variant selection and the operator profile.

pub mod difficulty;
pub mod profile;
pub mod solution;
pub mod variant;
pub mod work;

pub use difficulty::Difficulty;
pub use solution::{CodecError, encode_solution};
pub use variant::{SolverVariant, select_variant};
pub use work::{Nonce, WorkSnapshot, evaluate_candidate};
