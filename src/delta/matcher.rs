//! Part matcher module
//!
//! Slides a rolling checksum over a stale local copy to find byte
//! offsets whose content equals a remote block. Tolerates shifted,
//! inserted, and removed content: any alignment is a candidate, not just
//! block boundaries.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace};

use crate::delta::record::PartsRecord;
use crate::delta::rolling::RollingAdler32;
use crate::delta::ProgressFn;
use crate::error::TransferError;

/// One confirmed content match: the local bytes at `local_offset` equal
/// remote block `part_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchInfo {
    /// Index of the matching block in the record
    pub part_index: usize,
    /// Offset of the matching window in the local copy
    pub local_offset: u64,
}

/// Find all blocks of `record` that are already present in the file at
/// `local_path`.
///
/// Runs on a background worker: streams the file once, reports
/// fractional progress, and honors the abort flag between blocks. Each
/// rolling-checksum hit is confirmed with the strong digest before it
/// counts; a confirmed match skips a full window (rsync anchoring). Only
/// the first location of each block is recorded.
pub fn match_parts(
    record: &PartsRecord,
    local_path: &Path,
    progress: &ProgressFn,
    aborted: &AtomicBool,
) -> Result<Vec<MatchInfo>, TransferError> {
    let algorithm = record.digest_algorithm()?;
    let window = record.part_length as usize;

    let file = File::open(local_path).map_err(|e| {
        TransferError::file_not_found_with_path(e.to_string(), local_path.display().to_string())
    })?;
    let local_len = file
        .metadata()
        .map_err(TransferError::from)?
        .len();
    let mut reader = BufReader::with_capacity(128 * 1024, file);

    // Cheap filter first: group candidate blocks by rolling checksum
    let mut by_rolling: HashMap<u32, Vec<usize>> = HashMap::new();
    for (index, block) in record.blocks.iter().enumerate() {
        by_rolling.entry(block.rolling).or_default().push(index);
    }

    let mut matches = Vec::new();
    let mut matched_parts = HashSet::new();
    let mut rolling = RollingAdler32::new(window);
    let mut buf = vec![0u8; 64 * 1024];
    let mut position: u64 = 0;

    loop {
        if aborted.load(Ordering::Relaxed) {
            return Err(TransferError::broken("matching aborted"));
        }
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        for &byte in &buf[..read] {
            rolling.update(byte);
            position += 1;
            if !rolling.is_full() {
                continue;
            }
            let candidates = match by_rolling.get(&rolling.value()) {
                Some(c) => c,
                None => continue,
            };
            let window_content = rolling.window_bytes();
            let strong = algorithm.digest(&window_content);
            let confirmed = candidates
                .iter()
                .copied()
                .find(|i| !matched_parts.contains(i) && record.blocks[*i].strong == strong);
            if let Some(part_index) = confirmed {
                let local_offset = position - window as u64;
                trace!("Block {} matches at local offset {}", part_index, local_offset);
                matched_parts.insert(part_index);
                matches.push(MatchInfo {
                    part_index,
                    local_offset,
                });
                // Anchor: restart the window after a confirmed match
                rolling.reset();
            }
        }

        if local_len > 0 {
            progress((position as f64 / local_len as f64).min(1.0));
        }
    }

    progress(1.0);
    debug!(
        "Matched {} of {} blocks against {}",
        matches.len(),
        record.part_count(),
        local_path.display()
    );
    Ok(matches)
}
