//! Upload leg module
//!
//! Serves one file to one peer. Each upload runs on its own worker
//! task, draining a bounded command queue and streaming chunks through
//! the shared bandwidth limiter for the peer's locality.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::delta::{suggested_part_length, PartsRecordBuilder, ProgressFn};
use crate::descriptor::FileDescriptor;
use crate::error::TransferError;
use crate::limit::BandwidthLimiter;
use crate::parts::Range;
use crate::peer::{PeerId, PeerLink, PeerLocality};
use crate::protocol::{FileChunk, PartRequest, TransferMessage};
use crate::transfer::{TransferEvent, TransferPhase};

#[derive(Debug)]
enum UploadCommand {
    Part(PartRequest),
    RecordRequest,
    Stop,
}

/// One upload leg: serves the local authoritative copy of a file to a
/// single peer. Completion and failure are reported to the registry via
/// events, never decided here.
pub struct Upload {
    file: FileDescriptor,
    source_path: PathBuf,
    link: Arc<dyn PeerLink>,
    limiter: Arc<BandwidthLimiter>,
    config: Arc<TransferConfig>,
    start_offset: u64,
    commands: mpsc::Sender<UploadCommand>,
    receiver: Mutex<Option<mpsc::Receiver<UploadCommand>>>,
    aborted: Arc<AtomicBool>,
    started: AtomicBool,
    finished: AtomicBool,
    status: Mutex<(TransferPhase, f64)>,
}

impl Upload {
    /// Create an upload serving `source_path` to `link`
    pub fn new(
        file: FileDescriptor,
        source_path: PathBuf,
        link: Arc<dyn PeerLink>,
        limiter: Arc<BandwidthLimiter>,
        config: Arc<TransferConfig>,
        start_offset: u64,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.max_requests_queued * 5);
        Arc::new(Self {
            file,
            source_path,
            link,
            limiter,
            config,
            start_offset,
            commands: tx,
            receiver: Mutex::new(Some(rx)),
            aborted: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            status: Mutex::new((TransferPhase::None, 0.0)),
        })
    }

    /// The file being served
    pub fn file(&self) -> &FileDescriptor {
        &self.file
    }

    /// The receiving peer
    pub fn peer_id(&self) -> &PeerId {
        self.link.peer_id()
    }

    /// True once the worker is serving
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    /// True after external cancellation
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// True once the worker has reported its terminal event
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    /// Current phase and fractional progress
    pub fn phase(&self) -> (TransferPhase, f64) {
        *self.status.lock().unwrap()
    }

    /// Queue a part request from the remote downloader.
    ///
    /// Fails when the request is invalid for the served file version or
    /// the command queue overflows; the registry breaks the upload then.
    pub fn enqueue_part_request(&self, request: PartRequest) -> Result<(), TransferError> {
        if self.is_aborted() {
            return Ok(());
        }
        if !request.file.is_same_version(&self.file) || request.range.is_empty() {
            return Err(TransferError::general("invalid part request"));
        }
        if request.range.end() > self.file.size {
            return Err(TransferError::general("requested part exceeds file size"));
        }
        self.commands
            .try_send(UploadCommand::Part(request))
            .map_err(|_| TransferError::broken("too many part requests queued"))
    }

    /// Queue a block-digest record request from the remote downloader
    pub fn enqueue_record_request(&self) -> Result<(), TransferError> {
        if self.is_aborted() {
            return Ok(());
        }
        if self.file.size < self.config.delta_min_file_size {
            return Err(TransferError::general(
                "record requested for a file below the delta-sync threshold",
            ));
        }
        self.commands
            .try_send(UploadCommand::RecordRequest)
            .map_err(|_| TransferError::broken("too many requests queued"))
    }

    /// The downloader has everything it needs: served requests still
    /// ahead of the stop marker go out, then the worker finishes.
    pub fn stop(&self) {
        let _ = self.commands.try_send(UploadCommand::Stop);
    }

    /// Cancel the upload; the worker notices between chunks
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
        let _ = self.commands.try_send(UploadCommand::Stop);
    }

    /// Worker entry point; the registry spawns this on its pool.
    /// Reports started/completed/broken/aborted through `events`.
    pub async fn run(self: Arc<Self>, events: mpsc::UnboundedSender<TransferEvent>) {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .expect("upload worker started twice");

        self.started.store(true, Ordering::Relaxed);
        let _ = events.send(TransferEvent::UploadStarted {
            file: self.file.clone(),
            peer: self.peer_id().clone(),
        });
        info!("Upload of {} to {} started", self.file, self.peer_id());

        let outcome = self.serve(&mut receiver).await;
        self.finished.store(true, Ordering::Relaxed);
        match outcome {
            Ok(()) => {
                if self.is_aborted() {
                    let _ = events.send(TransferEvent::UploadAborted {
                        file: self.file.clone(),
                        peer: self.peer_id().clone(),
                    });
                } else {
                    self.set_status(TransferPhase::Done, 1.0);
                    info!("Upload of {} to {} finished", self.file, self.peer_id());
                    let _ = events.send(TransferEvent::UploadCompleted {
                        file: self.file.clone(),
                        peer: self.peer_id().clone(),
                    });
                }
            }
            Err(err) => {
                warn!(
                    "Upload of {} to {} broken: {}",
                    self.file,
                    self.peer_id(),
                    err
                );
                if self.link.is_connected() {
                    let _ = self
                        .link
                        .send(TransferMessage::AbortUpload {
                            file: self.file.clone(),
                        })
                        .await;
                }
                let _ = events.send(TransferEvent::UploadBroken {
                    file: self.file.clone(),
                    peer: self.peer_id().clone(),
                    problem: err.problem(),
                    detail: err.to_string(),
                });
            }
        }
    }

    async fn serve(
        self: &Arc<Self>,
        receiver: &mut mpsc::Receiver<UploadCommand>,
    ) -> Result<(), TransferError> {
        // Never serve bytes from a file that changed since it was
        // advertised: somebody may be editing it right now.
        self.check_modification_stamp().await?;

        let mut source = tokio::fs::File::open(&self.source_path)
            .await
            .map_err(|e| {
                TransferError::file_not_found_with_path(
                    e.to_string(),
                    self.source_path.display().to_string(),
                )
            })?;

        if !self.link.supports_part_requests() {
            return self.stream_whole_file(&mut source).await;
        }

        loop {
            if self.is_aborted() {
                return Ok(());
            }

            let command =
                tokio::time::timeout(self.config.upload_request_timeout, receiver.recv()).await;
            match command {
                // Nobody asked for anything within the window: the
                // remote side is done with us.
                Err(_) => return Ok(()),
                Ok(None) | Ok(Some(UploadCommand::Stop)) => return Ok(()),
                Ok(Some(UploadCommand::RecordRequest)) => {
                    self.serve_record().await?;
                }
                Ok(Some(UploadCommand::Part(request))) => {
                    self.set_status(TransferPhase::Uploading, request.progress);
                    self.serve_range(&mut source, request.range).await?;
                    self.check_modification_stamp().await?;
                }
            }
        }
    }

    /// Legacy fallback for peers without part-request support: push the
    /// whole file sequentially from the requested start offset.
    async fn stream_whole_file(
        self: &Arc<Self>,
        source: &mut tokio::fs::File,
    ) -> Result<(), TransferError> {
        debug!(
            "Peer {} lacks part-request support, streaming from offset {}",
            self.peer_id(),
            self.start_offset
        );
        let mut offset = self.start_offset;
        while offset < self.file.size {
            if self.is_aborted() {
                return Ok(());
            }
            let len = self.chunk_cap().min(self.file.size - offset);
            self.serve_range(source, Range::by_length(offset, len))
                .await?;
            offset += len;
            self.set_status(TransferPhase::Uploading, offset as f64 / self.file.size as f64);
            self.check_modification_stamp().await?;
        }
        Ok(())
    }

    /// Send one requested range, split into limiter-gated chunks no
    /// larger than the configured cap.
    async fn serve_range(
        self: &Arc<Self>,
        source: &mut tokio::fs::File,
        range: Range,
    ) -> Result<(), TransferError> {
        let cap = self.chunk_cap();
        let mut offset = range.start;
        let mut remaining = range.length;

        while remaining > 0 {
            if self.is_aborted() {
                return Ok(());
            }
            let len = cap.min(remaining);

            // Pay for the chunk before reading it
            let mut acquired = 0;
            while acquired < len {
                if self.is_aborted() {
                    self.limiter.return_available(acquired);
                    return Ok(());
                }
                acquired += self.limiter.request_bandwidth(len - acquired).await;
            }

            let mut data = vec![0u8; len as usize];
            source
                .seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(TransferError::from)?;
            if let Err(e) = source.read_exact(&mut data).await {
                // Short file: give back what we will not send
                self.limiter.return_available(len);
                return Err(TransferError::broken_with_source(
                    "requested part exceeds file size",
                    e.to_string(),
                ));
            }

            self.link
                .send(TransferMessage::FileChunk(FileChunk::new(
                    self.file.clone(),
                    offset,
                    Bytes::from(data),
                )))
                .await
                .map_err(|_| TransferError::peer_disconnected(self.peer_id().to_string()))?;

            offset += len;
            remaining -= len;
        }
        Ok(())
    }

    /// Hash the served file and reply with its block-digest record
    async fn serve_record(self: &Arc<Self>) -> Result<(), TransferError> {
        debug!("Building parts record of {} for {}", self.file, self.peer_id());
        self.set_status(TransferPhase::Hashing, 0.0);

        let path = self.source_path.clone();
        let algorithm = self.config.digest_algorithm;
        let part_length = suggested_part_length(self.file.size);
        let total = self.file.size;
        let progress: ProgressFn = {
            let me = self.clone();
            Arc::new(move |p| me.set_status(TransferPhase::Hashing, p))
        };
        let aborted = self.aborted.clone();

        let record = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path).map_err(|e| {
                TransferError::file_not_found_with_path(e.to_string(), path.display().to_string())
            })?;
            PartsRecordBuilder::new(algorithm, part_length).build(
                std::io::BufReader::new(file),
                total,
                &progress,
                &aborted,
            )
        })
        .await
        .map_err(|e| TransferError::general_with_source("record worker died", e.to_string()))??;

        self.link
            .send(TransferMessage::PartsRecordReply {
                file: self.file.clone(),
                record,
            })
            .await
            .map_err(|_| TransferError::peer_disconnected(self.peer_id().to_string()))?;

        // The remote matches against its stale copy before it starts
        // requesting parts.
        self.set_status(TransferPhase::RemoteMatching, 0.0);
        Ok(())
    }

    /// Largest chunk this upload may send at once
    fn chunk_cap(&self) -> u64 {
        let mut cap = self.config.max_chunk_size;
        if self.link.locality() == PeerLocality::Wan && self.config.upload_bps_wan > 0 {
            cap = cap.min(self.config.upload_bps_wan);
        }
        cap.max(1)
    }

    async fn check_modification_stamp(&self) -> Result<(), TransferError> {
        let metadata = tokio::fs::metadata(&self.source_path)
            .await
            .map_err(|e| {
                TransferError::file_not_found_with_path(
                    e.to_string(),
                    self.source_path.display().to_string(),
                )
            })?;
        let modified_millis = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        // Cross-platform timestamp precision: compare in two-second buckets
        if modified_millis / 2000 != self.file.modified_millis / 2000 {
            return Err(TransferError::broken(format!(
                "modification stamp mismatch on {}: expected {}, actual {}",
                self.source_path.display(),
                self.file.modified_millis,
                modified_millis
            )));
        }
        Ok(())
    }

    fn set_status(&self, phase: TransferPhase, progress: f64) {
        *self.status.lock().unwrap() = (phase, progress.clamp(0.0, 1.0));
    }
}

impl std::fmt::Debug for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upload")
            .field("file", &self.file.name)
            .field("peer", self.peer_id())
            .field("started", &self.is_started())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::testlink::MockLink;
    use std::io::Write;
    use std::time::Duration;

    fn write_source(name: &str, data: &[u8]) -> (PathBuf, FileDescriptor) {
        let path =
            std::env::temp_dir().join(format!("upload_test_{}_{}", std::process::id(), name));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        drop(f);
        let modified = std::fs::metadata(&path)
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let descriptor = FileDescriptor::new(name, data.len() as u64, 1, modified);
        (path, descriptor)
    }

    fn config() -> Arc<TransferConfig> {
        Arc::new(TransferConfig {
            max_chunk_size: 100,
            upload_request_timeout: Duration::from_millis(100),
            delta_min_file_size: 100,
            ..Default::default()
        })
    }

    fn spawn_upload(
        upload: &Arc<Upload>,
    ) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(upload.clone().run(tx));
        rx
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> TransferEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_serves_requested_part() {
        let data: Vec<u8> = (0..250u32).map(|i| (i % 256) as u8).collect();
        let (path, descriptor) = write_source("part", &data);
        let link = MockLink::lan("peer-1");
        let upload = Upload::new(
            descriptor.clone(),
            path.clone(),
            link.clone(),
            Arc::new(BandwidthLimiter::unlimited()),
            config(),
            0,
        );
        let mut events = spawn_upload(&upload);

        assert!(matches!(
            next_event(&mut events).await,
            TransferEvent::UploadStarted { .. }
        ));
        upload
            .enqueue_part_request(PartRequest::new(
                descriptor.clone(),
                Range::by_length(50, 100),
                0.0,
            ))
            .unwrap();
        upload.stop();
        assert!(matches!(
            next_event(&mut events).await,
            TransferEvent::UploadCompleted { .. }
        ));

        let chunks: Vec<FileChunk> = link
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                TransferMessage::FileChunk(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 50);
        assert_eq!(&chunks[0].data[..], &data[50..150]);

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_large_request_split_into_capped_chunks() {
        let data = vec![7u8; 350];
        let (path, descriptor) = write_source("split", &data);
        let link = MockLink::lan("peer-1");
        let upload = Upload::new(
            descriptor.clone(),
            path.clone(),
            link.clone(),
            Arc::new(BandwidthLimiter::unlimited()),
            config(),
            0,
        );
        let mut events = spawn_upload(&upload);
        let _ = next_event(&mut events).await;

        upload
            .enqueue_part_request(PartRequest::new(
                descriptor.clone(),
                Range::by_length(0, 350),
                0.0,
            ))
            .unwrap();
        upload.stop();
        let _ = next_event(&mut events).await;

        let offsets: Vec<u64> = link
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                TransferMessage::FileChunk(c) => Some(c.offset),
                _ => None,
            })
            .collect();
        // 350 bytes at a 100-byte cap
        assert_eq!(offsets, vec![0, 100, 200, 300]);

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_modification_mismatch_breaks_before_first_byte() {
        let data = vec![1u8; 200];
        let (path, mut descriptor) = write_source("stamp", &data);
        // Advertise a version that is hours older than the file on disk
        descriptor.modified_millis = descriptor.modified_millis.saturating_sub(3_600_000);
        let link = MockLink::lan("peer-1");
        let upload = Upload::new(
            descriptor,
            path.clone(),
            link.clone(),
            Arc::new(BandwidthLimiter::unlimited()),
            config(),
            0,
        );
        let mut events = spawn_upload(&upload);

        let _ = next_event(&mut events).await;
        let event = next_event(&mut events).await;
        assert!(matches!(event, TransferEvent::UploadBroken { .. }));
        assert!(link
            .sent()
            .iter()
            .all(|m| !matches!(m, TransferMessage::FileChunk(_))));

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_legacy_peer_gets_whole_stream() {
        let data: Vec<u8> = (0..250u32).map(|i| (i % 251) as u8).collect();
        let (path, descriptor) = write_source("legacy", &data);
        let link = MockLink::new("old-peer", PeerLocality::Lan, false, false);
        let upload = Upload::new(
            descriptor,
            path.clone(),
            link.clone(),
            Arc::new(BandwidthLimiter::unlimited()),
            config(),
            0,
        );
        let mut events = spawn_upload(&upload);
        let _ = next_event(&mut events).await;
        assert!(matches!(
            next_event(&mut events).await,
            TransferEvent::UploadCompleted { .. }
        ));

        let mut streamed = Vec::new();
        for message in link.sent() {
            if let TransferMessage::FileChunk(chunk) = message {
                assert_eq!(chunk.offset as usize, streamed.len());
                streamed.extend_from_slice(&chunk.data);
            }
        }
        assert_eq!(streamed, data);

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_record_request_replies_with_record() {
        let data = vec![3u8; 1000];
        let (path, descriptor) = write_source("record", &data);
        let link = MockLink::lan("peer-1");
        let upload = Upload::new(
            descriptor.clone(),
            path.clone(),
            link.clone(),
            Arc::new(BandwidthLimiter::unlimited()),
            config(),
            0,
        );
        let mut events = spawn_upload(&upload);
        let _ = next_event(&mut events).await;

        upload.enqueue_record_request().unwrap();
        upload.stop();
        let _ = next_event(&mut events).await;

        let record = link.sent().into_iter().find_map(|m| match m {
            TransferMessage::PartsRecordReply { record, .. } => Some(record),
            _ => None,
        });
        let record = record.expect("no record reply sent");
        assert_eq!(record.algorithm, "sha256");
        assert!(!record.file_digest.is_empty());

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_record_request_below_threshold_rejected() {
        let data = vec![3u8; 50];
        let (path, descriptor) = write_source("tiny_record", &data);
        let link = MockLink::lan("peer-1");
        let upload = Upload::new(
            descriptor,
            path.clone(),
            link,
            Arc::new(BandwidthLimiter::unlimited()),
            config(),
            0,
        );
        assert!(upload.enqueue_record_request().is_err());
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_abort_reports_aborted() {
        let data = vec![9u8; 200];
        let (path, descriptor) = write_source("abort", &data);
        let link = MockLink::lan("peer-1");
        let upload = Upload::new(
            descriptor,
            path.clone(),
            link,
            Arc::new(BandwidthLimiter::unlimited()),
            config(),
            0,
        );
        let mut events = spawn_upload(&upload);
        let _ = next_event(&mut events).await;

        upload.abort();
        assert!(matches!(
            next_event(&mut events).await,
            TransferEvent::UploadAborted { .. }
        ));
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_request_for_wrong_version_rejected() {
        let data = vec![1u8; 200];
        let (path, descriptor) = write_source("version", &data);
        let link = MockLink::lan("peer-1");
        let upload = Upload::new(
            descriptor.clone(),
            path.clone(),
            link,
            Arc::new(BandwidthLimiter::unlimited()),
            config(),
            0,
        );
        let mut newer = descriptor;
        newer.version += 1;
        let result = upload.enqueue_part_request(PartRequest::new(
            newer,
            Range::by_length(0, 10),
            0.0,
        ));
        assert!(result.is_err());
        std::fs::remove_file(path).unwrap();
    }
}
