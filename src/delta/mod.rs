//! Delta-sync module
//!
//! Block-digest records, rsync-style rolling-checksum matching, and the
//! copy stage that seeds a download from a stale local copy.

pub mod copier;
pub mod matcher;
pub mod record;
pub mod rolling;

pub use copier::copy_matched_parts;
pub use matcher::{match_parts, MatchInfo};
pub use record::{
    suggested_part_length, BlockDigest, DigestAlgorithm, PartsRecord, PartsRecordBuilder,
};
pub use rolling::RollingAdler32;

/// Progress callback used by the matcher, copier, builder, and verifier.
/// Receives a fraction in `0.0..=1.0`.
pub type ProgressFn = std::sync::Arc<dyn Fn(f64) + Send + Sync>;

/// A progress callback that discards all reports
pub fn no_progress() -> ProgressFn {
    std::sync::Arc::new(|_| {})
}
