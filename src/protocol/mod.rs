//! Transfer protocol module
//!
//! Semantic messages exchanged with peers. Wire encoding is the
//! transport layer's concern.

pub mod message;

pub use message::{FileChunk, PartRequest, TransferMessage};
