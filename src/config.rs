//! Transfer configuration module
//!
//! Resolved numeric settings handed to the engine by the embedding
//! application. The engine never reads configuration storage itself.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::delta::DigestAlgorithm;

/// Configuration for the transfer engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Upload limit towards LAN peers in bytes/sec (0 = unlimited)
    pub upload_bps_lan: u64,
    /// Upload limit towards WAN peers in bytes/sec (0 = unlimited)
    pub upload_bps_wan: u64,
    /// Download limit from LAN peers in bytes/sec (0 = unlimited)
    pub download_bps_lan: u64,
    /// Download limit from WAN peers in bytes/sec (0 = unlimited)
    pub download_bps_wan: u64,
    /// Maximum number of concurrently running uploads
    pub max_concurrent_uploads: usize,
    /// Maximum size of a single file chunk in bytes
    pub max_chunk_size: u64,
    /// Minimum file size for which delta-sync is attempted
    pub delta_min_file_size: u64,
    /// Maximum part requests queued per download leg
    pub max_requests_queued: usize,
    /// How long a leg may stay silent and unqueued before it breaks
    pub download_request_timeout: Duration,
    /// How long an upload worker waits for requests before giving up
    pub upload_request_timeout: Duration,
    /// Digest algorithm for block and whole-file verification
    pub digest_algorithm: DigestAlgorithm,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            upload_bps_lan: 0,
            upload_bps_wan: 0,
            download_bps_lan: 0,
            download_bps_wan: 0,
            max_concurrent_uploads: 10,
            max_chunk_size: 32 * 1024,
            delta_min_file_size: 8 * 1024,
            max_requests_queued: 15,
            download_request_timeout: Duration::from_secs(3 * 60),
            upload_request_timeout: Duration::from_secs(3 * 60),
            digest_algorithm: DigestAlgorithm::Sha256,
        }
    }
}

impl TransferConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_uploads == 0 {
            return Err(anyhow::anyhow!("max_concurrent_uploads must be at least 1"));
        }

        if self.max_chunk_size == 0 {
            return Err(anyhow::anyhow!("max_chunk_size must be at least 1 byte"));
        }

        if self.max_requests_queued == 0 {
            return Err(anyhow::anyhow!("max_requests_queued must be at least 1"));
        }

        if self.download_request_timeout == Duration::ZERO {
            return Err(anyhow::anyhow!("download_request_timeout cannot be zero"));
        }

        Ok(())
    }
}
