//! Byte-range tracking module
//!
//! Range algebra and the per-download map of ranges to transfer states.

pub mod range;
pub mod state;

pub use range::Range;
pub use state::{PartState, PartsState};
