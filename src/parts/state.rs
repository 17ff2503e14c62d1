//! Parts state module
//!
//! Tracks which byte ranges of a file are needed, requested, or already
//! present. The map always covers the whole file with disjoint,
//! run-length-coalesced entries.

use serde::{Deserialize, Serialize};

use crate::parts::range::Range;

/// State of one byte range during a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartState {
    /// Not yet requested from any source
    Needed,
    /// Requested from a source, not yet received
    Pending,
    /// Written to the temp file
    Available,
}

impl Default for PartState {
    fn default() -> Self {
        PartState::Needed
    }
}

/// One maximal contiguous run of equally-stated bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Segment {
    start: u64,
    length: u64,
    state: PartState,
}

impl Segment {
    fn range(&self) -> Range {
        Range::by_length(self.start, self.length)
    }
}

/// Authoritative per-download map of byte ranges to part states.
///
/// Every byte of `[0, file_length)` belongs to exactly one state at all
/// times. Overwrites split and merge entries as needed, so redundant or
/// overlapping inputs are safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartsState {
    file_length: u64,
    segments: Vec<Segment>,
}

impl PartsState {
    /// Create a parts state covering `file_length` bytes, all NEEDED
    pub fn new(file_length: u64) -> Self {
        let segments = if file_length == 0 {
            Vec::new()
        } else {
            vec![Segment {
                start: 0,
                length: file_length,
                state: PartState::Needed,
            }]
        };
        Self {
            file_length,
            segments,
        }
    }

    /// Total number of bytes covered
    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    /// The whole-file range
    pub fn file_range(&self) -> Range {
        Range::by_length(0, self.file_length)
    }

    /// Overwrite the state of `range`, splitting and merging neighboring
    /// entries to keep the map minimal and disjoint. Applying the same
    /// call twice yields the same map. Parts of `range` outside the file
    /// are ignored.
    pub fn set_part_state(&mut self, range: Range, state: PartState) {
        let clamped = match range.intersection(&self.file_range()) {
            Some(r) => r,
            None => return,
        };

        let mut pieces = Vec::with_capacity(self.segments.len() + 2);
        for seg in &self.segments {
            let sr = seg.range();
            match sr.intersection(&clamped) {
                None => pieces.push(*seg),
                Some(overlap) => {
                    if sr.start < overlap.start {
                        pieces.push(Segment {
                            start: sr.start,
                            length: overlap.start - sr.start,
                            state: seg.state,
                        });
                    }
                    pieces.push(Segment {
                        start: overlap.start,
                        length: overlap.length,
                        state,
                    });
                    if overlap.end() < sr.end() {
                        pieces.push(Segment {
                            start: overlap.end(),
                            length: sr.end() - overlap.end(),
                            state: seg.state,
                        });
                    }
                }
            }
        }
        self.segments = Self::coalesce(pieces);
    }

    /// The first (lowest-offset) maximal contiguous range in `state`
    pub fn find_first_part(&self, state: PartState) -> Option<Range> {
        self.segments
            .iter()
            .find(|s| s.state == state)
            .map(Segment::range)
    }

    /// Bytes of `range` currently in `state`
    pub fn count_bytes(&self, range: Range, state: PartState) -> u64 {
        self.segments
            .iter()
            .filter(|s| s.state == state)
            .filter_map(|s| s.range().intersection(&range))
            .map(|r| r.length)
            .sum()
    }

    /// True if every byte of the file is AVAILABLE
    pub fn is_completed(&self) -> bool {
        self.segments
            .iter()
            .all(|s| s.state == PartState::Available)
    }

    /// Flip every PENDING range back to NEEDED. Used before persisting a
    /// snapshot and when a swarm loses its sources.
    pub fn purge_pending(&mut self) {
        for seg in &mut self.segments {
            if seg.state == PartState::Pending {
                seg.state = PartState::Needed;
            }
        }
        self.segments = Self::coalesce(std::mem::take(&mut self.segments));
    }

    /// All maximal contiguous ranges currently in `state`
    pub fn ranges_in_state(&self, state: PartState) -> Vec<Range> {
        self.segments
            .iter()
            .filter(|s| s.state == state)
            .map(Segment::range)
            .collect()
    }

    fn coalesce(pieces: Vec<Segment>) -> Vec<Segment> {
        let mut merged: Vec<Segment> = Vec::with_capacity(pieces.len());
        for seg in pieces {
            if seg.length == 0 {
                continue;
            }
            if let Some(last) = merged.last_mut() {
                if last.state == seg.state {
                    last.length += seg.length;
                    continue;
                }
            }
            merged.push(seg);
        }
        merged
    }
}
