//! rust-swarm-transfer
//!
//! A multi-source swarming file transfer engine: downloads one logical
//! file from several peers at once, reuses locally-present blocks via
//! rsync-style delta matching, verifies the assembled result, and
//! throttles all data movement through shared token-bucket bandwidth
//! limiters.

pub mod config;
pub mod delta;
pub mod descriptor;
pub mod error;
pub mod limit;
pub mod parts;
pub mod peer;
pub mod protocol;
pub mod transfer;

pub use error::{TransferError, TransferProblem};

pub use config::TransferConfig;
pub use descriptor::FileDescriptor;
pub use parts::{PartState, PartsState, Range};
pub use peer::{PeerId, PeerLink, PeerLocality};
pub use protocol::{FileChunk, PartRequest, TransferMessage};

pub use delta::{
    copy_matched_parts, match_parts, BlockDigest, DigestAlgorithm, MatchInfo, PartsRecord,
    PartsRecordBuilder, RollingAdler32,
};
pub use limit::{BandwidthLimiter, BandwidthProvider, LimiterId};
pub use transfer::{
    Download, DownloadManager, TransferCounter, TransferEvent, TransferManager, TransferPhase,
    Upload,
};
pub use transfer::manager::SwarmState;
pub use transfer::registry::PendingDownload;
