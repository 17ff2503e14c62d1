//! Block digest record module
//!
//! The record a file holder produces so that a downloader can reuse
//! locally-present blocks: one rolling + strong digest per fixed-size
//! block, plus a whole-file digest for final verification.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::delta::rolling::adler32;
use crate::delta::ProgressFn;
use crate::error::TransferError;
use crate::parts::Range;

/// Digest algorithm used for strong block digests and the whole-file digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    /// Canonical name carried inside records
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
        }
    }

    /// Resolve an algorithm name received from a remote peer
    pub fn from_name(name: &str) -> Result<Self, TransferError> {
        match name {
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            other => Err(TransferError::digest_unavailable(other)),
        }
    }

    /// Digest output length in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
        }
    }

    /// Start an incremental hasher
    pub fn hasher(&self) -> DigestHasher {
        match self {
            DigestAlgorithm::Sha1 => DigestHasher::Sha1(Sha1::new()),
            DigestAlgorithm::Sha256 => DigestHasher::Sha256(Sha256::new()),
        }
    }

    /// Digest a complete byte slice
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }
}

/// Incremental hasher over the configured algorithm
pub enum DigestHasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl DigestHasher {
    /// Feed bytes into the hasher
    pub fn update(&mut self, data: &[u8]) {
        match self {
            DigestHasher::Sha1(h) => h.update(data),
            DigestHasher::Sha256(h) => h.update(data),
        }
    }

    /// Finish and return the digest bytes
    pub fn finalize(self) -> Vec<u8> {
        match self {
            DigestHasher::Sha1(h) => h.finalize().to_vec(),
            DigestHasher::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

/// Digests of one fixed-size block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDigest {
    /// Adler-32 of the block, used as the cheap rolling filter
    pub rolling: u32,
    /// Strong digest of the block
    pub strong: Vec<u8>,
}

/// Block-digest record of one file version.
///
/// Blocks cover `part_length`-sized windows from the start of the file;
/// a trailing tail shorter than one block carries no digest and is always
/// transferred. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartsRecord {
    /// Size of each digested block in bytes
    pub part_length: u64,
    /// Ordered block digests
    pub blocks: Vec<BlockDigest>,
    /// Digest over the entire file
    pub file_digest: Vec<u8>,
    /// Name of the digest algorithm used for `blocks` and `file_digest`
    pub algorithm: String,
}

impl PartsRecord {
    /// Number of digested blocks
    pub fn part_count(&self) -> usize {
        self.blocks.len()
    }

    /// The byte range a block occupies in the authoritative file
    pub fn part_range(&self, index: usize) -> Range {
        Range::by_length(index as u64 * self.part_length, self.part_length)
    }

    /// Resolve the record's digest algorithm
    pub fn digest_algorithm(&self) -> Result<DigestAlgorithm, TransferError> {
        DigestAlgorithm::from_name(&self.algorithm)
    }
}

/// Pick a block length for a file: roughly the square root of the file
/// size rounded up to a power of two, clamped to [4 KiB, 128 KiB].
pub fn suggested_part_length(file_size: u64) -> u64 {
    let root = (file_size as f64).sqrt() as u64;
    root.next_power_of_two().clamp(4 * 1024, 128 * 1024)
}

/// Streams a file once and produces its [`PartsRecord`]
pub struct PartsRecordBuilder {
    algorithm: DigestAlgorithm,
    part_length: u64,
}

impl PartsRecordBuilder {
    /// Create a builder for the given algorithm and block length
    pub fn new(algorithm: DigestAlgorithm, part_length: u64) -> Self {
        debug_assert!(part_length > 0);
        Self {
            algorithm,
            part_length,
        }
    }

    /// Build a record by streaming `reader`. `total_size` drives progress
    /// reporting; the abort flag is honored between blocks.
    pub fn build(
        &self,
        mut reader: impl Read,
        total_size: u64,
        progress: &ProgressFn,
        aborted: &AtomicBool,
    ) -> Result<PartsRecord, TransferError> {
        let mut blocks = Vec::new();
        let mut file_hasher = self.algorithm.hasher();
        let mut block = vec![0u8; self.part_length as usize];
        let mut processed: u64 = 0;

        loop {
            if aborted.load(Ordering::Relaxed) {
                return Err(TransferError::broken("record build aborted"));
            }
            let read = read_up_to(&mut reader, &mut block)?;
            if read == 0 {
                break;
            }
            file_hasher.update(&block[..read]);
            if read == self.part_length as usize {
                blocks.push(BlockDigest {
                    rolling: adler32(&block),
                    strong: self.algorithm.digest(&block),
                });
            }
            processed += read as u64;
            if total_size > 0 {
                progress(processed as f64 / total_size as f64);
            }
            if read < self.part_length as usize {
                break;
            }
        }

        progress(1.0);
        Ok(PartsRecord {
            part_length: self.part_length,
            blocks,
            file_digest: file_hasher.finalize(),
            algorithm: self.algorithm.name().to_string(),
        })
    }
}

/// Fill `buf` as far as the reader allows; only the final read of a
/// stream may come up short.
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, TransferError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::no_progress;
    use std::io::Cursor;

    fn build(data: &[u8], part_length: u64) -> PartsRecord {
        PartsRecordBuilder::new(DigestAlgorithm::Sha256, part_length)
            .build(
                Cursor::new(data.to_vec()),
                data.len() as u64,
                &no_progress(),
                &AtomicBool::new(false),
            )
            .unwrap()
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(DigestAlgorithm::from_name("sha1").unwrap(), DigestAlgorithm::Sha1);
        assert_eq!(
            DigestAlgorithm::from_name("sha256").unwrap(),
            DigestAlgorithm::Sha256
        );
        let err = DigestAlgorithm::from_name("md5").unwrap_err();
        assert!(matches!(err, TransferError::DigestUnavailable { .. }));
    }

    #[test]
    fn test_digest_lengths() {
        assert_eq!(DigestAlgorithm::Sha1.digest(b"x").len(), 20);
        assert_eq!(DigestAlgorithm::Sha256.digest(b"x").len(), 32);
    }

    #[test]
    fn test_builder_block_count() {
        let record = build(&[7u8; 1000], 256);
        // 3 full blocks; the 232-byte tail carries no digest
        assert_eq!(record.part_count(), 3);
        assert_eq!(record.part_length, 256);
    }

    #[test]
    fn test_builder_exact_multiple() {
        let record = build(&[7u8; 1024], 256);
        assert_eq!(record.part_count(), 4);
    }

    #[test]
    fn test_builder_file_smaller_than_block() {
        let record = build(b"tiny", 256);
        assert_eq!(record.part_count(), 0);
        assert_eq!(record.file_digest, DigestAlgorithm::Sha256.digest(b"tiny"));
    }

    #[test]
    fn test_block_digests_match_content() {
        let mut data = vec![0u8; 512];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let record = build(&data, 256);
        assert_eq!(record.blocks[0].rolling, adler32(&data[..256]));
        assert_eq!(
            record.blocks[1].strong,
            DigestAlgorithm::Sha256.digest(&data[256..])
        );
    }

    #[test]
    fn test_file_digest_covers_tail() {
        let data = [9u8; 700];
        let record = build(&data, 256);
        assert_eq!(record.file_digest, DigestAlgorithm::Sha256.digest(&data));
    }

    #[test]
    fn test_part_range() {
        let record = build(&[0u8; 1024], 256);
        assert_eq!(record.part_range(2), Range::by_length(512, 256));
    }

    #[test]
    fn test_build_abort() {
        let aborted = AtomicBool::new(true);
        let result = PartsRecordBuilder::new(DigestAlgorithm::Sha256, 256).build(
            Cursor::new(vec![0u8; 1024]),
            1024,
            &no_progress(),
            &aborted,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_suggested_part_length_bounds() {
        assert_eq!(suggested_part_length(0), 4 * 1024);
        assert_eq!(suggested_part_length(10_000), 4 * 1024);
        // 100 MiB -> sqrt = 10240 -> 16384
        assert_eq!(suggested_part_length(100 * 1024 * 1024), 16 * 1024);
        assert_eq!(suggested_part_length(u64::MAX / 2), 128 * 1024);
    }

    #[test]
    fn test_record_serde_round_trip() {
        let record = build(&[1u8; 512], 256);
        let json = serde_json::to_string(&record).unwrap();
        let back: PartsRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.digest_algorithm().unwrap(), DigestAlgorithm::Sha256);
    }
}
