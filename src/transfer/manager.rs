//! Download manager module
//!
//! The swarm coordinator for one target file: owns the parts state and
//! the temp assembly file, drives delta-sync, schedules part requests
//! across all source legs, and verifies the assembled result.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

use crate::config::TransferConfig;
use crate::delta::{copy_matched_parts, match_parts, DigestAlgorithm, PartsRecord, ProgressFn};
use crate::descriptor::FileDescriptor;
use crate::error::{TransferError, TransferProblem};
use crate::parts::{PartState, PartsState, Range};
use crate::peer::PeerId;
use crate::protocol::FileChunk;
use crate::transfer::counter::TransferCounter;
use crate::transfer::download::Download;
use crate::transfer::{TransferEvent, TransferPhase};

/// Lifecycle of one swarm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmState {
    /// No usable source yet
    WaitingForSource,
    /// First source requested, waiting for its readiness signal
    WaitingForUploadReady,
    /// Block-digest record requested, not yet received
    RequestingRecord,
    /// Matcher/copier reconciling the stale local copy
    MatchingAndCopying,
    /// Actively requesting and receiving parts
    Downloading,
    /// All parts available, digest check running
    Verifying,
    /// Verified and published
    Completed,
    /// Failed; possibly re-queued by the registry
    Broken,
    /// Cancelled locally
    Aborted,
}

impl SwarmState {
    /// True for terminal states
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            SwarmState::Completed | SwarmState::Broken | SwarmState::Aborted
        )
    }
}

/// Resume snapshot written next to the temp file while a download is
/// broken, so a later swarm for the same version continues where this
/// one stopped.
#[derive(Debug, Serialize, Deserialize)]
struct SwarmMeta {
    file: FileDescriptor,
    parts: PartsState,
}

struct SwarmInner {
    state: SwarmState,
    automatic: bool,
    multi_part_mode: Option<bool>,
    parts: Option<PartsState>,
    record: Option<PartsRecord>,
    temp: Option<tokio::fs::File>,
    sources: Vec<Arc<Download>>,
    pending_record_from: Option<PeerId>,
    counter: TransferCounter,
    started: bool,
    shut_down: bool,
}

impl SwarmInner {
    fn source(&self, peer: &PeerId) -> Option<Arc<Download>> {
        self.sources.iter().find(|d| d.peer_id() == peer).cloned()
    }
}

/// Coordinates one swarm: all download legs delivering one file.
///
/// Mutable state lives behind one per-swarm lock; every message
/// callback may be invoked from any task. Matching, copying, and
/// verification run on background workers that take the lock only to
/// install their finished result.
pub struct DownloadManager {
    file: FileDescriptor,
    temp_path: PathBuf,
    meta_path: PathBuf,
    local_copy: Option<PathBuf>,
    config: Arc<TransferConfig>,
    events: mpsc::UnboundedSender<TransferEvent>,
    halted: Arc<AtomicBool>,
    status: std::sync::Mutex<(TransferPhase, f64)>,
    inner: Mutex<SwarmInner>,
}

impl DownloadManager {
    /// Create a swarm for `file`, assembling into `temp_path`.
    ///
    /// `local_copy` is the path of a stale local version, if one exists;
    /// it makes the swarm eligible for delta-sync. A resume snapshot
    /// from an earlier broken swarm of the same version is picked up
    /// automatically; otherwise the temp file starts empty.
    pub async fn new(
        file: FileDescriptor,
        temp_path: PathBuf,
        local_copy: Option<PathBuf>,
        automatic: bool,
        config: Arc<TransferConfig>,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<Arc<Self>, TransferError> {
        let meta_path = PathBuf::from(format!("{}.meta", temp_path.display()));
        let resumed = load_meta(&meta_path, &file);
        if resumed.is_none() {
            // No trustworthy snapshot: whatever is in the temp file is
            // stale, start over.
            let _ = std::fs::remove_file(&meta_path);
            let _ = std::fs::remove_file(&temp_path);
        }

        let temp = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&temp_path)
            .await
            .map_err(|e| {
                TransferError::io_full(
                    "failed to open temp file",
                    temp_path.display().to_string(),
                    e.to_string(),
                )
            })?;
        temp.set_len(file.size).await.map_err(TransferError::from)?;

        let (parts, initial_bytes) = match resumed {
            Some(mut parts) => {
                parts.purge_pending();
                let available = parts.count_bytes(parts.file_range(), PartState::Available);
                info!(
                    "Resuming download of {}: {} of {} bytes already present",
                    file, available, file.size
                );
                (Some(parts), available)
            }
            None => (None, 0),
        };

        Ok(Arc::new(Self {
            meta_path,
            local_copy,
            config,
            events,
            halted: Arc::new(AtomicBool::new(false)),
            status: std::sync::Mutex::new((TransferPhase::None, 0.0)),
            inner: Mutex::new(SwarmInner {
                state: SwarmState::WaitingForSource,
                automatic,
                multi_part_mode: None,
                parts,
                record: None,
                temp: Some(temp),
                sources: Vec::new(),
                pending_record_from: None,
                counter: TransferCounter::with_initial(initial_bytes, file.size),
                started: false,
                shut_down: false,
            }),
            file,
            temp_path,
        }))
    }

    /// The file this swarm downloads
    pub fn file(&self) -> &FileDescriptor {
        &self.file
    }

    /// Path of the temp assembly file
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Current phase and fractional progress
    pub fn status(&self) -> (TransferPhase, f64) {
        *self.status.lock().unwrap()
    }

    /// Current lifecycle state
    pub async fn state(&self) -> SwarmState {
        self.inner.lock().await.state
    }

    /// True if the swarm reached a terminal state
    pub async fn is_done(&self) -> bool {
        self.inner.lock().await.state.is_done()
    }

    /// True once the swarm completed and verified
    pub async fn is_completed(&self) -> bool {
        self.inner.lock().await.state == SwarmState::Completed
    }

    /// True if the swarm broke
    pub async fn is_broken(&self) -> bool {
        self.inner.lock().await.state == SwarmState::Broken
    }

    /// Whether this download was requested automatically
    pub async fn is_requested_automatic(&self) -> bool {
        self.inner.lock().await.automatic
    }

    /// Number of attached source legs
    pub async fn source_count(&self) -> usize {
        self.inner.lock().await.sources.len()
    }

    /// True while at least one source leg is attached
    pub async fn has_sources(&self) -> bool {
        !self.inner.lock().await.sources.is_empty()
    }

    /// The leg serving from `peer`, if attached
    pub async fn source_for(&self, peer: &PeerId) -> Option<Arc<Download>> {
        self.inner.lock().await.source(peer)
    }

    /// Bytes accounted so far
    pub async fn bytes_transferred(&self) -> u64 {
        self.inner.lock().await.counter.bytes_transferred()
    }

    /// Snapshot of the current parts map, if one exists yet
    pub async fn parts_snapshot(&self) -> Option<PartsState> {
        self.inner.lock().await.parts.clone()
    }

    /// Attach a new source leg.
    ///
    /// The first leg fixes the swarm mode: all legs must agree on
    /// multi-part-request support, and a swarm around a legacy
    /// single-stream peer accepts no further sources.
    pub async fn add_source(self: &Arc<Self>, leg: Arc<Download>) -> Result<(), TransferError> {
        if !leg.file().is_same_version(&self.file) {
            return Err(TransferError::general(format!(
                "descriptor mismatch: {} vs {}",
                leg.file(),
                self.file
            )));
        }

        let mut inner = self.inner.lock().await;

        let supports = leg.link().supports_part_requests();
        match inner.multi_part_mode {
            None => inner.multi_part_mode = Some(supports),
            Some(mode) => {
                if supports != mode {
                    return Err(TransferError::general(
                        "source incompatible with established swarm mode",
                    ));
                }
                if !mode && !inner.sources.is_empty() {
                    return Err(TransferError::general(
                        "single-stream swarm already has its source",
                    ));
                }
            }
        }

        // A single non-automatic request claims the whole swarm
        if !leg.is_automatic() {
            inner.automatic = false;
        }

        debug!("Adding source {} to swarm of {}", leg.peer_id(), self.file);
        match inner.state {
            SwarmState::Broken | SwarmState::Aborted => {
                leg.set_broken(TransferProblem::BrokenTransfer, "manager already done")
                    .await;
            }
            SwarmState::Completed => {
                inner.sources.push(leg.clone());
                leg.set_completed().await;
            }
            SwarmState::WaitingForSource => {
                inner.sources.push(leg.clone());
                if self.file.size == 0 {
                    // Nothing to request for an empty file
                    self.complete_locked(&mut inner).await;
                    return Ok(());
                }
                let offset = inner
                    .parts
                    .as_ref()
                    .and_then(|p| p.find_first_part(PartState::Needed))
                    .map(|r| r.start)
                    .unwrap_or(0);
                inner.state = SwarmState::WaitingForUploadReady;
                if leg.request(offset).await.is_err() {
                    self.drop_failed_leg(&mut inner, &leg).await;
                    inner.state = SwarmState::WaitingForSource;
                }
            }
            _ => {
                inner.sources.push(leg.clone());
                if leg.request(0).await.is_err() {
                    self.drop_failed_leg(&mut inner, &leg).await;
                }
            }
        }
        Ok(())
    }

    /// Detach a source leg; its pending ranges become needed again and,
    /// if it was the record provider, the record is re-requested from
    /// another eligible leg.
    pub async fn remove_source(self: &Arc<Self>, peer: &PeerId) {
        let mut inner = self.inner.lock().await;
        let index = match inner.sources.iter().position(|d| d.peer_id() == peer) {
            Some(i) => i,
            None => return,
        };
        let leg = inner.sources.remove(index);
        debug!("Removing source {} from swarm of {}", peer, self.file);

        // All pending requests from that leg are void
        let ranges = leg.take_pending_ranges();
        if let Some(parts) = inner.parts.as_mut() {
            for range in ranges {
                parts.set_part_state(range, PartState::Needed);
            }
        }

        match inner.state {
            SwarmState::RequestingRecord => {
                if inner.pending_record_from.as_ref() == Some(peer) {
                    inner.pending_record_from = None;
                    self.request_record_locked(&mut inner, None).await;
                }
            }
            SwarmState::WaitingForUploadReady => {
                if inner.sources.is_empty() {
                    inner.state = SwarmState::WaitingForSource;
                }
            }
            SwarmState::Downloading => {
                if !inner.sources.is_empty() {
                    self.schedule_locked(&mut inner).await;
                }
            }
            _ => {}
        }
    }

    /// A leg signalled post-handshake readiness: request the record if
    /// delta-sync is eligible, otherwise start requesting parts.
    pub async fn ready_for_requests(self: &Arc<Self>, peer: &PeerId) {
        let mut inner = self.inner.lock().await;
        let leg = match inner.source(peer) {
            Some(leg) => leg,
            None => return,
        };
        leg.set_started();

        match inner.state {
            SwarmState::MatchingAndCopying | SwarmState::Verifying => {
                // Action is taken once the worker installs its result
            }
            SwarmState::Downloading => {
                self.schedule_locked(&mut inner).await;
            }
            SwarmState::RequestingRecord => {
                self.request_record_locked(&mut inner, Some(peer)).await;
            }
            SwarmState::WaitingForUploadReady => {
                if self.needs_record(&inner, &leg) {
                    inner.state = SwarmState::RequestingRecord;
                    self.request_record_locked(&mut inner, Some(peer)).await;
                } else {
                    if inner.parts.is_none() {
                        inner.parts = Some(PartsState::new(self.file.size));
                    }
                    if inner.parts.as_ref().unwrap().is_completed() {
                        self.start_verify_locked(&mut inner);
                    } else {
                        inner.state = SwarmState::Downloading;
                        self.mark_started_locked(&mut inner);
                        self.schedule_locked(&mut inner).await;
                    }
                }
            }
            SwarmState::Completed | SwarmState::Broken | SwarmState::Aborted => {
                leg.abort().await;
            }
            SwarmState::WaitingForSource => {
                self.set_broken_locked(
                    &mut inner,
                    TransferProblem::GeneralFailure,
                    "protocol error: readiness before any request",
                )
                .await;
            }
        }
    }

    /// The record provider answered: reconcile the stale local copy on
    /// a background worker, then resume scheduling.
    pub async fn received_parts_record(self: &Arc<Self>, peer: &PeerId, record: PartsRecord) {
        let mut inner = self.inner.lock().await;
        if let Some(leg) = inner.source(peer) {
            leg.touch();
        }
        if inner.state != SwarmState::RequestingRecord {
            // Remotes may resend; a record we no longer want is noise
            debug!("Unsolicited parts record in {:?} ignored", inner.state);
            return;
        }

        // A record we cannot hash is fatal for the whole runtime
        if let Err(err) = record.digest_algorithm() {
            self.set_broken_locked(&mut inner, err.problem(), &err.to_string())
                .await;
            return;
        }

        info!("Received parts record for {}, matching local copy", self.file);
        inner.pending_record_from = None;
        inner.record = Some(record.clone());
        inner.state = SwarmState::MatchingAndCopying;
        self.set_status_locked(&inner, TransferPhase::Matching, 0.0);
        drop(inner);

        let local = match &self.local_copy {
            Some(path) => path.clone(),
            None => {
                // Eligibility requires a local copy; losing it here is a
                // plain broken download.
                self.break_transfer(TransferProblem::FileNotFound, "local copy vanished")
                    .await;
                return;
            }
        };

        let manager = self.clone();
        let temp_path = self.temp_path.clone();
        let total_size = self.file.size;
        let halted = self.halted.clone();
        tokio::spawn(async move {
            let match_progress: ProgressFn = {
                let m = manager.clone();
                Arc::new(move |p| m.mirror_status(TransferPhase::Matching, p))
            };
            let copy_progress: ProgressFn = {
                let m = manager.clone();
                Arc::new(move |p| m.mirror_status(TransferPhase::Copying, p))
            };
            let worker_record = record;
            let result = tokio::task::spawn_blocking(move || {
                let matches = match_parts(&worker_record, &local, &match_progress, &halted)?;
                copy_matched_parts(
                    &local,
                    &temp_path,
                    &worker_record,
                    &matches,
                    total_size,
                    &copy_progress,
                    &halted,
                )
            })
            .await
            .map_err(|e| {
                TransferError::general_with_source("match worker died", e.to_string())
            })
            .and_then(|r| r);
            manager.install_match_result(result).await;
        });
    }

    /// A chunk arrived from `peer`: write it, update the parts state,
    /// and either verify (on full coverage) or keep scheduling.
    pub async fn received_chunk(self: &Arc<Self>, peer: &PeerId, chunk: FileChunk) {
        let mut inner = self.inner.lock().await;
        let leg = match inner.source(peer) {
            Some(leg) => leg,
            None => return,
        };

        match inner.state {
            SwarmState::Broken | SwarmState::Aborted => {
                leg.abort().await;
                return;
            }
            SwarmState::Completed | SwarmState::Verifying => {
                // Duplicate delivery after full coverage; harmless
                trace!("Late chunk at {} ignored", chunk.offset);
                return;
            }
            SwarmState::WaitingForUploadReady => {
                // A single-stream peer starts pushing without a
                // readiness round-trip
                if inner.parts.is_none() {
                    inner.parts = Some(PartsState::new(self.file.size));
                }
                inner.state = SwarmState::Downloading;
            }
            SwarmState::Downloading => {}
            _ => {
                self.set_broken_locked(
                    &mut inner,
                    TransferProblem::GeneralFailure,
                    "protocol error: chunk while no parts are requested",
                )
                .await;
                return;
            }
        }

        if !chunk.file.is_same_version(&self.file) {
            debug!("Chunk for a different file version ignored");
            return;
        }
        let range = chunk.range();
        if range.is_empty() || range.end() > self.file.size {
            debug!("Chunk {} out of bounds, ignored", range);
            return;
        }

        if let Err(e) = Self::store_chunk(&mut inner, &chunk).await {
            warn!("Temp file write failed: {}", e);
            self.set_broken_locked(
                &mut inner,
                TransferProblem::IoFailure,
                "couldn't write to temp file",
            )
            .await;
            return;
        }

        self.mark_started_locked(&mut inner);
        leg.chunk_received(range);
        inner.counter.chunk_transferred(range.length);
        let parts = inner.parts.as_mut().expect("parts exist while downloading");
        parts.set_part_state(range, PartState::Available);

        let available = parts.count_bytes(parts.file_range(), PartState::Available);
        let progress = available as f64 / self.file.size.max(1) as f64;
        self.set_status_locked(&inner, TransferPhase::Downloading, progress);

        if inner.parts.as_ref().unwrap().is_completed() {
            self.start_verify_locked(&mut inner);
        } else {
            self.schedule_locked(&mut inner).await;
        }
    }

    /// The remote side queued our request
    pub async fn set_queued(&self, peer: &PeerId) {
        let inner = self.inner.lock().await;
        if let Some(leg) = inner.source(peer) {
            leg.set_queued();
            let _ = self.events.send(TransferEvent::DownloadQueued {
                file: self.file.clone(),
                peer: peer.clone(),
            });
        }
    }

    /// Detach every leg that reports broken, reverting its pending
    /// ranges. Returns how many legs were removed.
    pub async fn sweep_broken_sources(self: &Arc<Self>) -> usize {
        let broken: Vec<Arc<Download>> = {
            let inner = self.inner.lock().await;
            inner
                .sources
                .iter()
                .filter(|leg| leg.is_broken())
                .cloned()
                .collect()
        };
        for leg in &broken {
            let (problem, detail) = leg.broken_problem();
            leg.set_broken(problem, &detail).await;
            self.remove_source(leg.peer_id()).await;
        }
        broken.len()
    }

    /// Break the whole swarm
    pub async fn break_transfer(self: &Arc<Self>, problem: TransferProblem, detail: &str) {
        let mut inner = self.inner.lock().await;
        self.set_broken_locked(&mut inner, problem, detail).await;
    }

    /// Cancel the swarm, keeping the temp file for a later resume
    pub async fn abort(self: &Arc<Self>) {
        self.abort_internal(false).await;
    }

    /// Cancel the swarm and delete the temp file
    pub async fn abort_and_cleanup(self: &Arc<Self>) {
        self.abort_internal(true).await;
    }

    async fn abort_internal(self: &Arc<Self>, cleanup: bool) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_done() {
            return;
        }
        info!("Download of {} aborted", self.file);
        inner.state = SwarmState::Aborted;
        self.shutdown_locked(&mut inner);
        let _ = std::fs::remove_file(&self.meta_path);
        if cleanup {
            let _ = std::fs::remove_file(&self.temp_path);
        }
        let sources = inner.sources.clone();
        drop(inner);
        for leg in sources {
            leg.abort().await;
        }
        let _ = self.events.send(TransferEvent::DownloadAborted {
            file: self.file.clone(),
        });
    }

    // ==================== internals ====================

    fn needs_record(&self, inner: &SwarmInner, leg: &Arc<Download>) -> bool {
        inner.record.is_none()
            && self.file.size >= self.config.delta_min_file_size
            && self
                .local_copy
                .as_ref()
                .map(|p| p.exists())
                .unwrap_or(false)
            && leg.link().supports_delta_sync()
    }

    async fn request_record_locked(
        self: &Arc<Self>,
        inner: &mut SwarmInner,
        preferred: Option<&PeerId>,
    ) {
        if let Some(peer) = inner.pending_record_from.clone() {
            match inner.source(&peer) {
                Some(leg) if !leg.is_broken() => return,
                _ => inner.pending_record_from = None,
            }
        }

        let candidate = preferred
            .and_then(|p| inner.source(p))
            .filter(|leg| leg.link().supports_delta_sync() && !leg.is_broken())
            .or_else(|| {
                inner
                    .sources
                    .iter()
                    .find(|leg| {
                        leg.is_started() && !leg.is_broken() && leg.link().supports_delta_sync()
                    })
                    .cloned()
            });

        if let Some(leg) = candidate {
            debug!("Requesting parts record from {}", leg.peer_id());
            self.set_status_locked(inner, TransferPhase::RecordRequest, 0.0);
            inner.pending_record_from = Some(leg.peer_id().clone());
            self.mark_started_locked(inner);
            if leg.request_parts_record().await.is_err() {
                inner.pending_record_from = None;
            }
        }
    }

    /// Core scheduling loop: hand out clamped NEEDED ranges to any
    /// started, unbroken leg with queue room until either nothing is
    /// needed or no leg can accept more work.
    async fn schedule_locked(self: &Arc<Self>, inner: &mut SwarmInner) {
        self.set_status_locked(inner, TransferPhase::Downloading, self.status().1);
        loop {
            let range = {
                let parts = match inner.parts.as_ref() {
                    Some(parts) => parts,
                    None => return,
                };
                match parts.find_first_part(PartState::Needed) {
                    Some(range) => range,
                    None => break,
                }
            };
            let clamped = Range::by_length(
                range.start,
                range.length.min(self.config.max_chunk_size),
            );

            let mut served = false;
            let legs: Vec<Arc<Download>> = inner.sources.clone();
            for leg in legs {
                if !leg.is_started() || leg.is_broken() {
                    continue;
                }
                match leg.request_part(clamped).await {
                    Ok(true) => {
                        served = true;
                        break;
                    }
                    Ok(false) => continue,
                    Err(_) => {
                        // The leg broke on send; its pending work is void
                        let ranges = leg.take_pending_ranges();
                        if let Some(parts) = inner.parts.as_mut() {
                            for r in ranges {
                                parts.set_part_state(r, PartState::Needed);
                            }
                        }
                        continue;
                    }
                }
            }

            if served {
                inner
                    .parts
                    .as_mut()
                    .unwrap()
                    .set_part_state(clamped, PartState::Pending);
                trace!("Range {} now pending", clamped);
            } else {
                break;
            }
        }
    }

    async fn store_chunk(inner: &mut SwarmInner, chunk: &FileChunk) -> std::io::Result<()> {
        let temp = inner.temp.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "temp file closed")
        })?;
        temp.seek(std::io::SeekFrom::Start(chunk.offset)).await?;
        temp.write_all(&chunk.data).await?;
        // The verifier reads through a separate handle
        temp.flush().await?;
        Ok(())
    }

    async fn install_match_result(self: &Arc<Self>, result: Result<PartsState, TransferError>) {
        let mut inner = self.inner.lock().await;
        if inner.shut_down || inner.state != SwarmState::MatchingAndCopying {
            return;
        }
        match result {
            Ok(parts) => {
                if parts.file_length() != self.file.size {
                    self.set_broken_locked(
                        &mut inner,
                        TransferProblem::BrokenTransfer,
                        "local copy changed during delta-sync",
                    )
                    .await;
                    return;
                }
                let available = parts.count_bytes(parts.file_range(), PartState::Available);
                info!(
                    "Delta-sync seeded {} of {} bytes for {}",
                    available, self.file.size, self.file
                );
                inner.parts = Some(parts);
                inner.counter = TransferCounter::with_initial(available, self.file.size);

                if inner.parts.as_ref().unwrap().is_completed() {
                    self.start_verify_locked(&mut inner);
                } else if inner.sources.is_empty() {
                    self.set_broken_locked(
                        &mut inner,
                        TransferProblem::BrokenTransfer,
                        "out of sources",
                    )
                    .await;
                } else {
                    inner.state = SwarmState::Downloading;
                    self.schedule_locked(&mut inner).await;
                }
            }
            Err(err) => {
                self.set_broken_locked(&mut inner, err.problem(), &err.to_string())
                    .await;
            }
        }
    }

    /// Launch whole-file verification on a background worker. With no
    /// record the bytes are trusted on arrival.
    fn start_verify_locked(self: &Arc<Self>, inner: &mut SwarmInner) {
        inner.state = SwarmState::Verifying;
        self.set_status_locked(inner, TransferPhase::Verifying, 0.0);
        debug!("Verifying assembled file for {}", self.file);

        let manager = self.clone();
        let record = inner.record.clone();
        let temp_path = self.temp_path.clone();
        let halted = self.halted.clone();
        tokio::spawn(async move {
            let progress: ProgressFn = {
                let m = manager.clone();
                Arc::new(move |p| m.mirror_status(TransferPhase::Verifying, p))
            };
            let result = tokio::task::spawn_blocking(move || match record {
                None => Ok(true),
                Some(record) => {
                    let algorithm = record.digest_algorithm()?;
                    let digest = hash_file(&temp_path, algorithm, &progress, &halted)?;
                    Ok(digest == record.file_digest)
                }
            })
            .await
            .map_err(|e| TransferError::general_with_source("verify worker died", e.to_string()))
            .and_then(|r| r);
            manager.finish_verification(result).await;
        });
    }

    async fn finish_verification(self: &Arc<Self>, result: Result<bool, TransferError>) {
        let mut inner = self.inner.lock().await;
        if inner.shut_down || inner.state != SwarmState::Verifying {
            return;
        }
        match result {
            Ok(true) => {
                self.complete_locked(&mut inner).await;
            }
            Ok(false) => {
                // Not fatal: the record may have been bogus. Start over.
                warn!("Verification of {} FAILED, resetting download", self.file);
                inner.counter = TransferCounter::new(self.file.size);
                if let Some(parts) = inner.parts.as_mut() {
                    let full = parts.file_range();
                    parts.set_part_state(full, PartState::Needed);
                }
                inner.record = None;
                inner.state = SwarmState::Downloading;
                self.set_status_locked(&inner, TransferPhase::Downloading, 0.0);
                self.schedule_locked(&mut inner).await;
            }
            Err(err) => {
                self.set_broken_locked(&mut inner, err.problem(), &err.to_string())
                    .await;
            }
        }
    }

    async fn complete_locked(self: &Arc<Self>, inner: &mut SwarmInner) {
        if inner.state.is_done() {
            return;
        }
        info!("Completed download of {}", self.file);
        inner.state = SwarmState::Completed;
        self.set_status_locked(inner, TransferPhase::Done, 1.0);
        self.shutdown_locked(inner);
        let _ = std::fs::remove_file(&self.meta_path);

        for leg in inner.sources.clone() {
            leg.set_completed().await;
        }
        let _ = self.events.send(TransferEvent::DownloadCompleted {
            file: self.file.clone(),
            temp_path: self.temp_path.clone(),
        });
    }

    async fn set_broken_locked(
        self: &Arc<Self>,
        inner: &mut SwarmInner,
        problem: TransferProblem,
        detail: &str,
    ) {
        if inner.state.is_done() {
            return;
        }
        warn!("Download of {} broken: {} ({})", self.file, problem, detail);
        inner.state = SwarmState::Broken;
        self.shutdown_locked(inner);

        // Keep partial progress for a retry
        if let Some(parts) = inner.parts.as_mut() {
            parts.purge_pending();
            save_meta(&self.meta_path, &self.file, parts);
        }
        // A temp file that never got a byte is just litter
        if let Ok(meta) = std::fs::metadata(&self.temp_path) {
            if meta.len() == 0
                || inner
                    .parts
                    .as_ref()
                    .map(|p| p.count_bytes(p.file_range(), PartState::Available) == 0)
                    .unwrap_or(true)
            {
                let _ = std::fs::remove_file(&self.temp_path);
                let _ = std::fs::remove_file(&self.meta_path);
            }
        }

        for leg in inner.sources.clone() {
            leg.set_broken(problem, detail).await;
        }
        let _ = self.events.send(TransferEvent::DownloadBroken {
            file: self.file.clone(),
            problem,
            detail: detail.to_string(),
            automatic: inner.automatic,
        });
    }

    fn shutdown_locked(&self, inner: &mut SwarmInner) {
        if inner.shut_down {
            return;
        }
        inner.shut_down = true;
        self.halted.store(true, Ordering::Relaxed);
        inner.temp = None;
        inner.record = None;
        inner.pending_record_from = None;
    }

    fn mark_started_locked(&self, inner: &mut SwarmInner) {
        if !inner.started {
            inner.started = true;
            let _ = self.events.send(TransferEvent::DownloadStarted {
                file: self.file.clone(),
            });
        }
    }

    fn set_status_locked(&self, inner: &SwarmInner, phase: TransferPhase, progress: f64) {
        *self.status.lock().unwrap() = (phase, progress.clamp(0.0, 1.0));
        for leg in &inner.sources {
            leg.set_phase(phase, progress);
        }
    }

    /// Status update from a background worker; never takes the swarm lock
    fn mirror_status(&self, phase: TransferPhase, progress: f64) {
        *self.status.lock().unwrap() = (phase, progress.clamp(0.0, 1.0));
    }

    async fn drop_failed_leg(&self, inner: &mut SwarmInner, leg: &Arc<Download>) {
        inner.sources.retain(|d| !Arc::ptr_eq(d, leg));
        leg.set_broken(TransferProblem::PeerDisconnected, "initial request failed")
            .await;
    }
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("file", &self.file.name)
            .field("temp", &self.temp_path)
            .finish()
    }
}

/// Stream-hash a file for completion verification
fn hash_file(
    path: &Path,
    algorithm: DigestAlgorithm,
    progress: &ProgressFn,
    halted: &AtomicBool,
) -> Result<Vec<u8>, TransferError> {
    use std::io::Read;

    let file = std::fs::File::open(path).map_err(TransferError::from)?;
    let total = file.metadata().map_err(TransferError::from)?.len();
    let mut reader = std::io::BufReader::with_capacity(128 * 1024, file);
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; 64 * 1024];
    let mut done: u64 = 0;

    loop {
        if halted.load(Ordering::Relaxed) {
            return Err(TransferError::broken("verification aborted"));
        }
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..read]);
        done += read as u64;
        if total > 0 {
            progress(done as f64 / total as f64);
        }
    }
    progress(1.0);
    Ok(hasher.finalize())
}

fn load_meta(meta_path: &Path, file: &FileDescriptor) -> Option<PartsState> {
    let raw = std::fs::read(meta_path).ok()?;
    let meta: SwarmMeta = serde_json::from_slice(&raw).ok()?;
    if meta.file.is_same_version(file) && meta.parts.file_length() == file.size {
        Some(meta.parts)
    } else {
        None
    }
}

fn save_meta(meta_path: &Path, file: &FileDescriptor, parts: &PartsState) {
    let meta = SwarmMeta {
        file: file.clone(),
        parts: parts.clone(),
    };
    match serde_json::to_vec(&meta) {
        Ok(raw) => {
            if let Err(e) = std::fs::write(meta_path, raw) {
                warn!("Couldn't save resume snapshot: {}", e);
            }
        }
        Err(e) => warn!("Couldn't serialize resume snapshot: {}", e),
    }
}
