//! Match copier module
//!
//! Second stage of delta-sync: copies matched blocks from the stale
//! local copy into the temp assembly file and seeds the parts state so
//! only unmatched ranges are requested over the network.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::delta::matcher::MatchInfo;
use crate::delta::record::PartsRecord;
use crate::delta::ProgressFn;
use crate::error::TransferError;
use crate::parts::{PartState, PartsState};

/// Copy every matched block from `local_path` into `temp_path` at its
/// target offset and return a [`PartsState`] with the copied ranges
/// AVAILABLE and everything else NEEDED.
///
/// Each block is re-verified against its strong digest on the bytes
/// actually read, so a source file modified since matching cannot poison
/// the assembly; a block that no longer verifies is left NEEDED. A
/// source that shrank below a matched offset counts as a broken
/// download. The abort flag is honored between blocks.
pub fn copy_matched_parts(
    local_path: &Path,
    temp_path: &Path,
    record: &PartsRecord,
    matches: &[MatchInfo],
    total_size: u64,
    progress: &ProgressFn,
    aborted: &AtomicBool,
) -> Result<PartsState, TransferError> {
    let algorithm = record.digest_algorithm()?;
    let part_length = record.part_length as usize;

    let mut source = File::open(local_path).map_err(|e| {
        TransferError::file_not_found_with_path(e.to_string(), local_path.display().to_string())
    })?;
    let mut temp = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(temp_path)
        .map_err(|e| {
            TransferError::io_full(
                "failed to open temp file",
                temp_path.display().to_string(),
                e.to_string(),
            )
        })?;
    temp.set_len(total_size).map_err(TransferError::from)?;

    let mut parts = PartsState::new(total_size);
    let mut block = vec![0u8; part_length];
    let mut copied = 0usize;

    for (done, m) in matches.iter().enumerate() {
        if aborted.load(Ordering::Relaxed) {
            return Err(TransferError::broken("copying aborted"));
        }

        source
            .seek(SeekFrom::Start(m.local_offset))
            .map_err(TransferError::from)?;
        if let Err(e) = source.read_exact(&mut block) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                // Source shrank since matching
                return Err(TransferError::broken_with_source(
                    "local copy changed during delta-sync",
                    e.to_string(),
                ));
            }
            return Err(e.into());
        }

        if record.blocks[m.part_index].strong != algorithm.digest(&block) {
            warn!(
                "Block {} changed since matching, leaving it needed",
                m.part_index
            );
            continue;
        }

        let target = record.part_range(m.part_index);
        temp.seek(SeekFrom::Start(target.start))
            .map_err(TransferError::from)?;
        temp.write_all(&block).map_err(TransferError::from)?;
        parts.set_part_state(target, PartState::Available);
        copied += 1;

        if !matches.is_empty() {
            progress((done + 1) as f64 / matches.len() as f64);
        }
    }

    temp.flush().map_err(TransferError::from)?;
    progress(1.0);
    debug!(
        "Copied {} matched blocks ({} bytes) into {}",
        copied,
        copied as u64 * record.part_length,
        temp_path.display()
    );
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::matcher::match_parts;
    use crate::delta::no_progress;
    use crate::delta::record::{DigestAlgorithm, PartsRecordBuilder};
    use crate::parts::Range;
    use std::io::Cursor;

    fn record_of(data: &[u8], part_length: u64) -> PartsRecord {
        PartsRecordBuilder::new(DigestAlgorithm::Sha256, part_length)
            .build(
                Cursor::new(data.to_vec()),
                data.len() as u64,
                &no_progress(),
                &AtomicBool::new(false),
            )
            .unwrap()
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("copier_test_{}_{}", std::process::id(), name))
    }

    fn write_file(path: &Path, data: &[u8]) {
        let mut f = File::create(path).unwrap();
        f.write_all(data).unwrap();
    }

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| ((i as u32 * 37 + seed as u32 * 11) % 249) as u8)
            .collect()
    }

    #[test]
    fn test_seeds_matched_ranges() {
        let data = patterned(1000, 1);
        let record = record_of(&data, 250);

        // Local copy identical in the first half, different in the second
        let mut local = data.clone();
        for byte in &mut local[500..] {
            *byte = byte.wrapping_add(77);
        }
        let local_path = temp_path("seed_local");
        let out_path = temp_path("seed_out");
        write_file(&local_path, &local);

        let matches =
            match_parts(&record, &local_path, &no_progress(), &AtomicBool::new(false)).unwrap();
        let parts = copy_matched_parts(
            &local_path,
            &out_path,
            &record,
            &matches,
            1000,
            &no_progress(),
            &AtomicBool::new(false),
        )
        .unwrap();

        assert_eq!(
            parts.count_bytes(Range::by_length(0, 500), PartState::Available),
            500
        );
        assert_eq!(
            parts.count_bytes(Range::by_length(500, 500), PartState::Needed),
            500
        );

        // The copied bytes are the authoritative content
        let mut assembled = Vec::new();
        File::open(&out_path)
            .unwrap()
            .read_to_end(&mut assembled)
            .unwrap();
        assert_eq!(assembled.len(), 1000);
        assert_eq!(&assembled[..500], &data[..500]);

        std::fs::remove_file(local_path).unwrap();
        std::fs::remove_file(out_path).unwrap();
    }

    #[test]
    fn test_no_matches_leaves_all_needed() {
        let data = patterned(1000, 2);
        let record = record_of(&data, 250);
        let local_path = temp_path("none_local");
        let out_path = temp_path("none_out");
        write_file(&local_path, &[0u8; 100]);

        let parts = copy_matched_parts(
            &local_path,
            &out_path,
            &record,
            &[],
            1000,
            &no_progress(),
            &AtomicBool::new(false),
        )
        .unwrap();
        assert_eq!(parts.count_bytes(parts.file_range(), PartState::Needed), 1000);

        std::fs::remove_file(local_path).unwrap();
        std::fs::remove_file(out_path).unwrap();
    }

    #[test]
    fn test_shrunk_source_is_broken() {
        let data = patterned(1000, 3);
        let record = record_of(&data, 250);
        let local_path = temp_path("shrunk_local");
        let out_path = temp_path("shrunk_out");
        // Source too short for the claimed match offset
        write_file(&local_path, &data[..300]);

        let matches = vec![MatchInfo {
            part_index: 3,
            local_offset: 750,
        }];
        let err = copy_matched_parts(
            &local_path,
            &out_path,
            &record,
            &matches,
            1000,
            &no_progress(),
            &AtomicBool::new(false),
        )
        .unwrap_err();
        assert!(matches!(err, TransferError::Broken { .. }));

        std::fs::remove_file(local_path).unwrap();
        let _ = std::fs::remove_file(out_path);
    }

    #[test]
    fn test_stale_block_left_needed() {
        let data = patterned(500, 4);
        let record = record_of(&data, 250);
        let local_path = temp_path("stale_local");
        let out_path = temp_path("stale_out");
        // Content at the matched offset no longer equals the block
        write_file(&local_path, &patterned(500, 9));

        let matches = vec![MatchInfo {
            part_index: 0,
            local_offset: 0,
        }];
        let parts = copy_matched_parts(
            &local_path,
            &out_path,
            &record,
            &matches,
            500,
            &no_progress(),
            &AtomicBool::new(false),
        )
        .unwrap();
        assert_eq!(parts.count_bytes(parts.file_range(), PartState::Available), 0);

        std::fs::remove_file(local_path).unwrap();
        std::fs::remove_file(out_path).unwrap();
    }

    #[test]
    fn test_abort_flag() {
        let data = patterned(500, 5);
        let record = record_of(&data, 250);
        let local_path = temp_path("abort_local");
        let out_path = temp_path("abort_out");
        write_file(&local_path, &data);

        let matches = vec![MatchInfo {
            part_index: 0,
            local_offset: 0,
        }];
        let err = copy_matched_parts(
            &local_path,
            &out_path,
            &record,
            &matches,
            500,
            &no_progress(),
            &AtomicBool::new(true),
        )
        .unwrap_err();
        assert!(matches!(err, TransferError::Broken { .. }));

        std::fs::remove_file(local_path).unwrap();
        let _ = std::fs::remove_file(out_path);
    }
}
