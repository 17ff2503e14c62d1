//! Transfer module
//!
//! Per-source transfer legs, the swarm coordinator, and the registry
//! tracking all active transfers.

pub mod counter;
pub mod download;
pub mod manager;
pub mod registry;
pub mod upload;

#[cfg(test)]
pub(crate) mod testlink;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::descriptor::FileDescriptor;
use crate::error::TransferProblem;
use crate::peer::PeerId;

pub use counter::TransferCounter;
pub use download::Download;
pub use manager::DownloadManager;
pub use registry::TransferManager;
pub use upload::Upload;

/// What a transfer is currently doing, roughly ordered by pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferPhase {
    /// Nothing happening yet
    None,
    /// Waiting for the remote block-digest record
    RecordRequest,
    /// Hashing the local file to answer a record request (upload side)
    Hashing,
    /// The remote side is matching against its stale copy (upload side)
    RemoteMatching,
    /// Matching the stale local copy against the record
    Matching,
    /// Copying matched blocks into the temp file
    Copying,
    /// Receiving chunks
    Downloading,
    /// Sending chunks
    Uploading,
    /// Verifying the assembled file digest
    Verifying,
    /// Finished
    Done,
}

/// Events reported to the embedding application
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A download moved bytes for the first time
    DownloadStarted { file: FileDescriptor },
    /// The remote side queued our download request
    DownloadQueued { file: FileDescriptor, peer: PeerId },
    /// A download completed and verified; the assembled bytes are at
    /// `temp_path`, ready to be published by the collaborator
    DownloadCompleted {
        file: FileDescriptor,
        temp_path: PathBuf,
    },
    /// A download broke
    DownloadBroken {
        file: FileDescriptor,
        problem: TransferProblem,
        detail: String,
        automatic: bool,
    },
    /// A download was aborted locally
    DownloadAborted { file: FileDescriptor },
    /// An upload worker started serving
    UploadStarted { file: FileDescriptor, peer: PeerId },
    /// An upload finished serving
    UploadCompleted { file: FileDescriptor, peer: PeerId },
    /// An upload broke
    UploadBroken {
        file: FileDescriptor,
        peer: PeerId,
        problem: TransferProblem,
        detail: String,
    },
    /// An upload was aborted locally
    UploadAborted { file: FileDescriptor, peer: PeerId },
}
