//! Transfer counter module
//!
//! Byte accounting for one transfer: how much has moved, how much is
//! expected, and an average rate.

use std::time::Instant;

/// Counts bytes moved by one transfer
#[derive(Debug, Clone)]
pub struct TransferCounter {
    bytes_transferred: u64,
    expected: u64,
    started_at: Instant,
}

impl TransferCounter {
    /// Create a counter expecting `expected` total bytes
    pub fn new(expected: u64) -> Self {
        Self::with_initial(0, expected)
    }

    /// Create a counter that already accounts for `initial` bytes,
    /// e.g. after delta-sync seeded part of the file
    pub fn with_initial(initial: u64, expected: u64) -> Self {
        Self {
            bytes_transferred: initial,
            expected,
            started_at: Instant::now(),
        }
    }

    /// Record a transferred chunk
    pub fn chunk_transferred(&mut self, len: u64) {
        self.bytes_transferred += len;
    }

    /// Total bytes accounted so far
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Expected total bytes
    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Fraction complete, 0..=1
    pub fn progress(&self) -> f64 {
        if self.expected == 0 {
            1.0
        } else {
            (self.bytes_transferred as f64 / self.expected as f64).min(1.0)
        }
    }

    /// Average bytes per second since the counter was created
    pub fn average_bps(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            0.0
        } else {
            self.bytes_transferred as f64 / elapsed
        }
    }

    /// Drop all accounting, e.g. after a failed verification
    pub fn reset(&mut self) {
        self.bytes_transferred = 0;
        self.started_at = Instant::now();
    }
}
