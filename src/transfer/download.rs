//! Download leg module
//!
//! One download leg per source peer in a swarm: a bounded queue of
//! outstanding part requests plus the liveness bookkeeping that decides
//! when the leg is broken.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::TransferConfig;
use crate::descriptor::FileDescriptor;
use crate::error::{TransferError, TransferProblem};
use crate::parts::Range;
use crate::peer::{PeerId, PeerLink};
use crate::protocol::{PartRequest, TransferMessage};
use crate::transfer::TransferPhase;

#[derive(Debug)]
struct LegState {
    pending: VecDeque<PartRequest>,
    last_touch: Instant,
    queued: bool,
    started: bool,
    completed: bool,
    marked_broken: bool,
    phase: TransferPhase,
    progress: f64,
}

/// One per-peer download leg within a swarm
pub struct Download {
    file: FileDescriptor,
    link: Arc<dyn PeerLink>,
    automatic: bool,
    max_queued: usize,
    request_timeout: Duration,
    state: Mutex<LegState>,
}

impl Download {
    /// Create a leg for `file` served by `link`
    pub fn new(
        file: FileDescriptor,
        link: Arc<dyn PeerLink>,
        automatic: bool,
        config: &TransferConfig,
    ) -> Self {
        Self {
            file,
            link,
            automatic,
            max_queued: config.max_requests_queued,
            request_timeout: config.download_request_timeout,
            state: Mutex::new(LegState {
                pending: VecDeque::new(),
                last_touch: Instant::now(),
                queued: false,
                started: false,
                completed: false,
                marked_broken: false,
                phase: TransferPhase::None,
                progress: 0.0,
            }),
        }
    }

    /// The file this leg downloads
    pub fn file(&self) -> &FileDescriptor {
        &self.file
    }

    /// Identity of the serving peer
    pub fn peer_id(&self) -> &PeerId {
        self.link.peer_id()
    }

    /// The transport handle of this leg
    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }

    /// True if the download was initiated automatically rather than by
    /// an explicit user request
    pub fn is_automatic(&self) -> bool {
        self.automatic
    }

    /// True once the remote side confirmed readiness or delivered data
    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    /// Mark the leg as started (upload-ready received)
    pub fn set_started(&self) {
        let mut st = self.state.lock().unwrap();
        st.started = true;
        st.last_touch = Instant::now();
    }

    /// The remote side queued our request; suppresses the liveness timeout
    pub fn set_queued(&self) {
        let mut st = self.state.lock().unwrap();
        st.queued = true;
        st.last_touch = Instant::now();
        trace!("Download of {} queued at {}", self.file, self.peer_id());
    }

    /// True if the remote side has us queued and the leg is healthy
    pub fn is_queued(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.queued && !st.marked_broken
    }

    /// Refresh the last-activity stamp
    pub fn touch(&self) {
        self.state.lock().unwrap().last_touch = Instant::now();
    }

    /// Mirror the swarm phase into this leg for status displays
    pub fn set_phase(&self, phase: TransferPhase, progress: f64) {
        let mut st = self.state.lock().unwrap();
        st.phase = phase;
        st.progress = progress;
    }

    /// Current phase and fractional progress
    pub fn phase(&self) -> (TransferPhase, f64) {
        let st = self.state.lock().unwrap();
        (st.phase, st.progress)
    }

    /// Request the legacy whole-stream download starting at `start_offset`
    pub async fn request(&self, start_offset: u64) -> Result<(), TransferError> {
        self.send(TransferMessage::RequestDownload {
            file: self.file.clone(),
            start_offset,
        })
        .await
    }

    /// Ask the peer for its block-digest record
    pub async fn request_parts_record(&self) -> Result<(), TransferError> {
        debug!("Requesting parts record from {}", self.peer_id());
        self.send(TransferMessage::RequestPartsRecord {
            file: self.file.clone(),
        })
        .await
    }

    /// Request one part from the peer.
    ///
    /// Returns `Ok(false)` without enqueueing when the pending queue is
    /// full, signaling the scheduler to pick a different leg. A send
    /// failure marks the leg broken.
    pub async fn request_part(&self, range: Range) -> Result<bool, TransferError> {
        let request = {
            let mut st = self.state.lock().unwrap();
            if st.marked_broken {
                return Err(TransferError::broken("leg already broken"));
            }
            if st.pending.len() >= self.max_queued {
                trace!(
                    "Queue full on {} ({} pending), scheduler must pick another leg",
                    self.peer_id(),
                    st.pending.len()
                );
                return Ok(false);
            }
            let request = PartRequest::new(self.file.clone(), range, st.progress);
            st.pending.push_back(request.clone());
            request
        };

        if let Err(e) = self
            .link
            .send(TransferMessage::RequestPart(request))
            .await
        {
            let mut st = self.state.lock().unwrap();
            st.pending.pop_back();
            st.marked_broken = true;
            warn!("Part request to {} failed: {}", self.peer_id(), e);
            return Err(TransferError::peer_disconnected(self.peer_id().to_string()));
        }
        Ok(true)
    }

    /// A chunk covering `range` arrived: prune every pending request the
    /// chunk satisfies. The remote may coalesce several requested
    /// sub-ranges into one larger chunk.
    pub fn chunk_received(&self, range: Range) {
        let mut st = self.state.lock().unwrap();
        st.started = true;
        st.last_touch = Instant::now();
        let before = st.pending.len();
        st.pending.retain(|req| !range.contains(&req.range));
        trace!(
            "Chunk {} from {} satisfied {} pending requests",
            range,
            self.peer_id(),
            before - st.pending.len()
        );
    }

    /// Snapshot of the outstanding part requests
    pub fn pending_requests(&self) -> Vec<PartRequest> {
        self.state.lock().unwrap().pending.iter().cloned().collect()
    }

    /// Remove and return the ranges of all outstanding requests
    pub fn take_pending_ranges(&self) -> Vec<Range> {
        let mut st = self.state.lock().unwrap();
        st.pending.drain(..).map(|req| req.range).collect()
    }

    /// True if this leg can no longer deliver: the connection is lost,
    /// the leg was explicitly broken, or it went silent past the timeout
    /// without being queued at the remote side.
    pub fn is_broken(&self) -> bool {
        let st = self.state.lock().unwrap();
        if st.marked_broken {
            return true;
        }
        if st.completed {
            return false;
        }
        if !self.link.is_connected() {
            debug!("Break cause: {} not connected", self.peer_id());
            return true;
        }
        if !st.queued && st.last_touch.elapsed() > self.request_timeout {
            warn!("Break cause: request timeout on {}", self.peer_id());
            return true;
        }
        false
    }

    /// The reason this leg would report when broken
    pub fn broken_problem(&self) -> (TransferProblem, String) {
        if !self.link.is_connected() {
            (
                TransferProblem::PeerDisconnected,
                format!("{} disconnected", self.peer_id()),
            )
        } else {
            (
                TransferProblem::BrokenTransfer,
                "request timeout".to_string(),
            )
        }
    }

    /// Latch the leg broken and tell the peer to stop serving
    pub async fn set_broken(&self, problem: TransferProblem, detail: &str) {
        {
            let mut st = self.state.lock().unwrap();
            if st.marked_broken {
                return;
            }
            st.marked_broken = true;
        }
        debug!(
            "Download leg {} broken: {} ({})",
            self.peer_id(),
            problem,
            detail
        );
        if self.link.is_connected() {
            let _ = self
                .link
                .send(TransferMessage::AbortDownload {
                    file: self.file.clone(),
                })
                .await;
        }
    }

    /// Tell the peer we are no longer interested
    pub async fn abort(&self) {
        if self.link.is_connected() {
            let _ = self
                .link
                .send(TransferMessage::AbortDownload {
                    file: self.file.clone(),
                })
                .await;
        }
    }

    /// Mark complete and release the remote upload slot
    pub async fn set_completed(&self) {
        {
            let mut st = self.state.lock().unwrap();
            st.completed = true;
            st.phase = TransferPhase::Done;
            st.progress = 1.0;
        }
        let _ = self
            .link
            .send(TransferMessage::StopUpload {
                file: self.file.clone(),
            })
            .await;
    }

    async fn send(&self, message: TransferMessage) -> Result<(), TransferError> {
        self.link.send(message).await.map_err(|e| {
            TransferError::broken_with_source("send to peer failed", e.to_string())
        })
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock().unwrap();
        f.debug_struct("Download")
            .field("file", &self.file.name)
            .field("peer", self.peer_id())
            .field("pending", &st.pending.len())
            .field("queued", &st.queued)
            .field("started", &st.started)
            .field("broken", &st.marked_broken)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::testlink::MockLink;
    use std::time::Duration;

    fn descriptor() -> FileDescriptor {
        FileDescriptor::new("data.bin", 1000, 1, 0)
    }

    fn config() -> TransferConfig {
        TransferConfig {
            max_requests_queued: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_request_part_enqueues() {
        let link = MockLink::lan("peer-1");
        let leg = Download::new(descriptor(), link.clone(), false, &config());

        assert!(leg.request_part(Range::by_length(0, 100)).await.unwrap());
        assert_eq!(leg.pending_requests().len(), 1);
        assert_eq!(link.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_queue_full_returns_false() {
        let link = MockLink::lan("peer-1");
        let leg = Download::new(descriptor(), link.clone(), false, &config());

        for i in 0..3 {
            assert!(leg
                .request_part(Range::by_length(i * 100, 100))
                .await
                .unwrap());
        }
        assert!(!leg.request_part(Range::by_length(300, 100)).await.unwrap());
        assert_eq!(leg.pending_requests().len(), 3);
        // Nothing was sent for the rejected request
        assert_eq!(link.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_chunk_prunes_contained_requests() {
        let link = MockLink::lan("peer-1");
        let leg = Download::new(descriptor(), link.clone(), false, &config());

        leg.request_part(Range::by_length(100, 100)).await.unwrap();
        leg.request_part(Range::by_length(200, 100)).await.unwrap();
        leg.request_part(Range::by_length(500, 100)).await.unwrap();

        // The remote coalesced the first two requests into one chunk
        leg.chunk_received(Range::by_length(100, 200));
        let pending = leg.pending_requests();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].range, Range::by_length(500, 100));
    }

    #[tokio::test]
    async fn test_send_failure_marks_broken() {
        let link = MockLink::lan("peer-1");
        let leg = Download::new(descriptor(), link.clone(), false, &config());

        link.fail_sends(true);
        let err = leg.request_part(Range::by_length(0, 100)).await;
        assert!(err.is_err());
        assert!(leg.is_broken());
        assert!(leg.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_breaks_leg() {
        let link = MockLink::lan("peer-1");
        let leg = Download::new(descriptor(), link.clone(), false, &config());
        assert!(!leg.is_broken());

        link.set_connected(false);
        assert!(leg.is_broken());
        assert_eq!(leg.broken_problem().0, TransferProblem::PeerDisconnected);
    }

    #[tokio::test]
    async fn test_timeout_breaks_unqueued_leg() {
        let link = MockLink::lan("peer-1");
        let mut cfg = config();
        cfg.download_request_timeout = Duration::from_millis(10);
        let leg = Download::new(descriptor(), link.clone(), false, &cfg);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(leg.is_broken());
    }

    #[tokio::test]
    async fn test_queued_leg_survives_timeout() {
        let link = MockLink::lan("peer-1");
        let mut cfg = config();
        cfg.download_request_timeout = Duration::from_millis(10);
        let leg = Download::new(descriptor(), link.clone(), false, &cfg);

        leg.set_queued();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!leg.is_broken());
        assert!(leg.is_queued());
    }

    #[tokio::test]
    async fn test_take_pending_ranges() {
        let link = MockLink::lan("peer-1");
        let leg = Download::new(descriptor(), link.clone(), false, &config());
        leg.request_part(Range::by_length(100, 100)).await.unwrap();
        leg.request_part(Range::by_length(300, 100)).await.unwrap();

        let ranges = leg.take_pending_ranges();
        assert_eq!(
            ranges,
            vec![Range::by_length(100, 100), Range::by_length(300, 100)]
        );
        assert!(leg.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_set_completed_sends_stop_upload() {
        let link = MockLink::lan("peer-1");
        let leg = Download::new(descriptor(), link.clone(), false, &config());
        leg.set_completed().await;
        assert!(matches!(
            link.sent().last(),
            Some(TransferMessage::StopUpload { .. })
        ));
        // A completed leg never reports broken
        link.set_connected(false);
        assert!(!leg.is_broken());
    }
}
