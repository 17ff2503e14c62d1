//! Transfer protocol messages
//!
//! Defines all message types exchanged between swarm members.

use bytes::Bytes;

use crate::delta::PartsRecord;
use crate::descriptor::FileDescriptor;
use crate::parts::Range;

/// A request for one byte range of a file
#[derive(Debug, Clone, PartialEq)]
pub struct PartRequest {
    /// The file being downloaded
    pub file: FileDescriptor,
    /// The requested byte range
    pub range: Range,
    /// Estimated overall progress of the requesting side, 0..=1
    pub progress: f64,
}

impl PartRequest {
    /// Create a new part request
    pub fn new(file: FileDescriptor, range: Range, progress: f64) -> Self {
        Self {
            file,
            range,
            progress: progress.clamp(0.0, 1.0),
        }
    }
}

/// A payload chunk; `offset` and the data length define the covered range
#[derive(Debug, Clone)]
pub struct FileChunk {
    /// The file the chunk belongs to
    pub file: FileDescriptor,
    /// Offset of the first byte within the file
    pub offset: u64,
    /// Chunk payload
    pub data: Bytes,
}

impl FileChunk {
    /// Create a new file chunk
    pub fn new(file: FileDescriptor, offset: u64, data: Bytes) -> Self {
        Self { file, offset, data }
    }

    /// The byte range covered by this chunk
    pub fn range(&self) -> Range {
        Range::by_length(self.offset, self.data.len() as u64)
    }
}

/// Messages exchanged between swarm members
#[derive(Debug, Clone)]
pub enum TransferMessage {
    /// Legacy whole-stream download request, starting at an offset
    RequestDownload {
        file: FileDescriptor,
        start_offset: u64,
    },
    /// Multi-source range request
    RequestPart(PartRequest),
    /// Payload chunk
    FileChunk(FileChunk),
    /// Ask the holder for its block-digest record (delta-sync handshake)
    RequestPartsRecord { file: FileDescriptor },
    /// Reply carrying the block-digest record
    PartsRecordReply {
        file: FileDescriptor,
        record: PartsRecord,
    },
    /// The requester has everything it needs; stop serving
    StopUpload { file: FileDescriptor },
    /// The downloader gives up on this source
    AbortDownload { file: FileDescriptor },
    /// The uploader stops serving this file
    AbortUpload { file: FileDescriptor },
    /// The upload slot request has been queued at the remote side
    DownloadQueued { file: FileDescriptor },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> FileDescriptor {
        FileDescriptor::new("data.bin", 1000, 1, 0)
    }

    #[test]
    fn test_chunk_range() {
        let chunk = FileChunk::new(descriptor(), 300, Bytes::from(vec![0u8; 200]));
        assert_eq!(chunk.range(), Range::by_length(300, 200));
    }

    #[test]
    fn test_part_request_clamps_progress() {
        let req = PartRequest::new(descriptor(), Range::by_length(0, 100), 1.7);
        assert_eq!(req.progress, 1.0);
        let req = PartRequest::new(descriptor(), Range::by_length(0, 100), -0.5);
        assert_eq!(req.progress, 0.0);
    }
}
