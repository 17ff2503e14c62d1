//! Transfer registry module
//!
//! Tracks all active swarms and uploads, enforces the upload slot
//! limit, owns the shared bandwidth limiters, re-queues broken
//! downloads, and dispatches transfer events to the embedding
//! application.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::descriptor::FileDescriptor;
use crate::error::TransferError;
use crate::limit::{BandwidthLimiter, BandwidthProvider, LimiterId};
use crate::peer::{PeerId, PeerLink, PeerLocality};
use crate::protocol::TransferMessage;
use crate::transfer::download::Download;
use crate::transfer::manager::DownloadManager;
use crate::transfer::upload::Upload;
use crate::transfer::TransferEvent;

/// A download waiting for a new source after its swarm broke
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDownload {
    pub file: FileDescriptor,
    pub automatic: bool,
}

struct RegistryState {
    managers: HashMap<String, Arc<DownloadManager>>,
    pending: Vec<PendingDownload>,
    queued_uploads: Vec<Arc<Upload>>,
    active_uploads: Vec<Arc<Upload>>,
}

/// Registry of all active transfers.
///
/// Swarms and upload workers report through an internal event channel;
/// the registry's dispatcher does its bookkeeping (slot promotion,
/// re-queuing) and forwards every event to the embedding application.
pub struct TransferManager {
    config: Arc<TransferConfig>,
    provider: BandwidthProvider,
    lan_input: Arc<BandwidthLimiter>,
    wan_input: Arc<BandwidthLimiter>,
    lan_output: Arc<BandwidthLimiter>,
    wan_output: Arc<BandwidthLimiter>,
    limiter_ids: [LimiterId; 4],
    internal_tx: mpsc::UnboundedSender<TransferEvent>,
    internal_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TransferEvent>>>,
    public_tx: mpsc::UnboundedSender<TransferEvent>,
    public_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TransferEvent>>>,
    pending_path: std::sync::Mutex<Option<PathBuf>>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
    state: Mutex<RegistryState>,
}

impl TransferManager {
    /// Create a registry with the four shared traffic-class limiters
    /// registered at the configured rates.
    pub fn new(config: TransferConfig) -> Arc<Self> {
        let provider = BandwidthProvider::new();
        let lan_input = Arc::new(BandwidthLimiter::unlimited());
        let wan_input = Arc::new(BandwidthLimiter::unlimited());
        let lan_output = Arc::new(BandwidthLimiter::unlimited());
        let wan_output = Arc::new(BandwidthLimiter::unlimited());
        let limiter_ids = [
            provider.register(lan_input.clone(), config.download_bps_lan),
            provider.register(wan_input.clone(), config.download_bps_wan),
            provider.register(lan_output.clone(), config.upload_bps_lan),
            provider.register(wan_output.clone(), config.upload_bps_wan),
        ];

        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (public_tx, public_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config: Arc::new(config),
            provider,
            lan_input,
            wan_input,
            lan_output,
            wan_output,
            limiter_ids,
            internal_tx,
            internal_rx: std::sync::Mutex::new(Some(internal_rx)),
            public_tx,
            public_rx: std::sync::Mutex::new(Some(public_rx)),
            pending_path: std::sync::Mutex::new(None),
            dispatcher: std::sync::Mutex::new(None),
            state: Mutex::new(RegistryState {
                managers: HashMap::new(),
                pending: Vec::new(),
                queued_uploads: Vec::new(),
                active_uploads: Vec::new(),
            }),
        })
    }

    /// Start the bandwidth refill timer and the event dispatcher
    pub fn start(self: &Arc<Self>) {
        self.provider.start();
        let mut dispatcher = self.dispatcher.lock().unwrap();
        if dispatcher.is_some() {
            return;
        }
        let mut rx = self
            .internal_rx
            .lock()
            .unwrap()
            .take()
            .expect("registry started twice");
        let registry = self.clone();
        *dispatcher = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                registry.handle_event(&event).await;
                let _ = registry.public_tx.send(event);
            }
        }));
        info!("Transfer manager started");
    }

    /// Stop timers, abort all transfers, and release resources
    pub async fn shutdown(self: &Arc<Self>) {
        info!("Shutting down transfer manager");
        self.provider.shutdown();
        for id in self.limiter_ids {
            self.provider.deregister(id);
        }

        let (managers, uploads) = {
            let state = self.state.lock().await;
            (
                state.managers.values().cloned().collect::<Vec<_>>(),
                state
                    .active_uploads
                    .iter()
                    .chain(state.queued_uploads.iter())
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        };
        for manager in managers {
            manager.abort().await;
        }
        for upload in uploads {
            upload.abort();
        }

        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// The event stream for the embedding application; can be taken once
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransferEvent>> {
        self.public_rx.lock().unwrap().take()
    }

    /// The shared input limiter for a peer's locality
    pub fn input_limiter(&self, locality: PeerLocality) -> Arc<BandwidthLimiter> {
        match locality {
            PeerLocality::Lan => self.lan_input.clone(),
            PeerLocality::Wan => self.wan_input.clone(),
        }
    }

    /// The shared output limiter for a peer's locality
    pub fn output_limiter(&self, locality: PeerLocality) -> Arc<BandwidthLimiter> {
        match locality {
            PeerLocality::Lan => self.lan_output.clone(),
            PeerLocality::Wan => self.wan_output.clone(),
        }
    }

    /// Apply new rate limits to all four traffic classes (0 = unlimited)
    pub fn update_speed_limits(
        &self,
        download_bps_lan: u64,
        download_bps_wan: u64,
        upload_bps_lan: u64,
        upload_bps_wan: u64,
    ) {
        let [lan_in, wan_in, lan_out, wan_out] = self.limiter_ids;
        self.provider.set_limit_bps(lan_in, download_bps_lan);
        self.provider.set_limit_bps(wan_in, download_bps_wan);
        self.provider.set_limit_bps(lan_out, upload_bps_lan);
        self.provider.set_limit_bps(wan_out, upload_bps_wan);
        info!(
            "Speed limits now dl {}/{} ul {}/{} B/s (lan/wan)",
            download_bps_lan, download_bps_wan, upload_bps_lan, upload_bps_wan
        );
    }

    // ==================== downloads ====================

    /// Create (or return) the swarm downloading `file`.
    ///
    /// `temp_path` is where the swarm assembles the file; `local_copy`
    /// is a stale local version eligible for delta-sync, if any.
    pub async fn request_download(
        self: &Arc<Self>,
        file: FileDescriptor,
        temp_path: PathBuf,
        local_copy: Option<PathBuf>,
        automatic: bool,
    ) -> Result<Arc<DownloadManager>, TransferError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.managers.get(&file.name) {
            if existing.file().is_same_version(&file) {
                return Ok(existing.clone());
            }
            return Err(TransferError::general(format!(
                "another version of {} is already downloading",
                file.name
            )));
        }

        let manager = DownloadManager::new(
            file.clone(),
            temp_path,
            local_copy,
            automatic,
            self.config.clone(),
            self.internal_tx.clone(),
        )
        .await?;
        state.managers.insert(file.name.clone(), manager.clone());
        state.pending.retain(|p| p.file.name != file.name);
        self.save_pending(&state.pending);
        debug!("Download of {} requested (automatic: {})", file, automatic);
        Ok(manager)
    }

    /// Attach `link` as a source leg to the swarm downloading `file`
    pub async fn add_download_source(
        self: &Arc<Self>,
        file: &FileDescriptor,
        link: Arc<dyn PeerLink>,
        automatic: bool,
    ) -> Result<(), TransferError> {
        let manager = self
            .download_manager(file)
            .await
            .ok_or_else(|| TransferError::general(format!("no download active for {}", file)))?;
        let leg = Arc::new(Download::new(
            file.clone(),
            link,
            automatic,
            &self.config,
        ));
        manager.add_source(leg).await
    }

    /// The swarm downloading `file`, if any
    pub async fn download_manager(&self, file: &FileDescriptor) -> Option<Arc<DownloadManager>> {
        let state = self.state.lock().await;
        state
            .managers
            .get(&file.name)
            .filter(|m| m.file().is_same_version(file))
            .cloned()
    }

    /// Number of active swarms
    pub async fn active_download_count(&self) -> usize {
        self.state.lock().await.managers.len()
    }

    /// Downloads waiting for a new source
    pub async fn pending_downloads(&self) -> Vec<PendingDownload> {
        self.state.lock().await.pending.clone()
    }

    /// Detach broken legs everywhere and break swarms left sourceless
    pub async fn check_downloads(self: &Arc<Self>) {
        let managers: Vec<Arc<DownloadManager>> = {
            let state = self.state.lock().await;
            state.managers.values().cloned().collect()
        };
        for manager in managers {
            let swept = manager.sweep_broken_sources().await;
            if swept > 0 && !manager.has_sources().await && !manager.is_done().await {
                manager
                    .break_transfer(
                        crate::error::TransferProblem::PeerDisconnected,
                        "no sources left",
                    )
                    .await;
            }
        }
    }

    /// Break every automatically-requested transfer whose target is now
    /// excluded by the collaborator's filter.
    pub async fn check_exclusions(self: &Arc<Self>, excluded: impl Fn(&FileDescriptor) -> bool) {
        let managers: Vec<Arc<DownloadManager>> = {
            let state = self.state.lock().await;
            state.managers.values().cloned().collect()
        };
        for manager in managers {
            if manager.is_requested_automatic().await && excluded(manager.file()) {
                debug!("Breaking excluded automatic download of {}", manager.file());
                manager
                    .break_transfer(
                        crate::error::TransferProblem::BrokenTransfer,
                        "target excluded",
                    )
                    .await;
            }
        }
    }

    /// Break every automatically-requested download that a newer remote
    /// version has made pointless. `newest` is the collaborator's view
    /// of the latest known version of each file.
    pub async fn check_superseded(self: &Arc<Self>, newest: impl Fn(&FileDescriptor) -> Option<FileDescriptor>) {
        let managers: Vec<Arc<DownloadManager>> = {
            let state = self.state.lock().await;
            state.managers.values().cloned().collect()
        };
        for manager in managers {
            if !manager.is_requested_automatic().await {
                continue;
            }
            if let Some(latest) = newest(manager.file()) {
                if latest.is_newer_than(manager.file()) {
                    debug!(
                        "Breaking superseded automatic download of {}",
                        manager.file()
                    );
                    manager
                        .break_transfer(
                            crate::error::TransferProblem::BrokenTransfer,
                            "newer version available",
                        )
                        .await;
                }
            }
        }
    }

    // ==================== uploads ====================

    /// Handle a remote `RequestDownload`: queue an upload of
    /// `source_path` to the requesting peer. A request for a file
    /// already being served to that peer supersedes the old upload.
    pub async fn request_upload(
        self: &Arc<Self>,
        link: Arc<dyn PeerLink>,
        file: FileDescriptor,
        source_path: PathBuf,
        start_offset: u64,
    ) -> Result<Arc<Upload>, TransferError> {
        let limiter = self.output_limiter(link.locality());
        let upload = Upload::new(
            file.clone(),
            source_path,
            link.clone(),
            limiter,
            self.config.clone(),
            start_offset,
        );

        let superseded = {
            let mut state = self.state.lock().await;
            let peer = link.peer_id().clone();
            let old = remove_upload(&mut state.active_uploads, &file, &peer)
                .or_else(|| remove_upload(&mut state.queued_uploads, &file, &peer));

            if state.active_uploads.len() < self.config.max_concurrent_uploads {
                state.active_uploads.push(upload.clone());
                tokio::spawn(upload.clone().run(self.internal_tx.clone()));
            } else {
                debug!("Upload slots full, queuing upload of {} to {}", file, peer);
                state.queued_uploads.push(upload.clone());
                let _ = link
                    .send(TransferMessage::DownloadQueued { file: file.clone() })
                    .await;
            }
            old
        };

        if let Some(old) = superseded {
            warn!(
                "Superseding earlier upload of {} to {}",
                file,
                link.peer_id()
            );
            old.abort();
            let _ = self.internal_tx.send(TransferEvent::UploadBroken {
                file: old.file().clone(),
                peer: old.peer_id().clone(),
                problem: crate::error::TransferProblem::SupersededRequest,
                detail: "replaced by a newer request".to_string(),
            });
        }
        Ok(upload)
    }

    /// The upload of `file` to `peer`, if one is active or queued
    pub async fn upload_for(&self, file: &FileDescriptor, peer: &PeerId) -> Option<Arc<Upload>> {
        let state = self.state.lock().await;
        state
            .active_uploads
            .iter()
            .chain(state.queued_uploads.iter())
            .find(|u| u.file().is_same_version(file) && u.peer_id() == peer)
            .cloned()
    }

    /// Number of running upload workers
    pub async fn active_upload_count(&self) -> usize {
        self.state.lock().await.active_uploads.len()
    }

    /// Number of uploads waiting for a slot
    pub async fn queued_upload_count(&self) -> usize {
        self.state.lock().await.queued_uploads.len()
    }

    // ==================== message entry points ====================

    /// Route a message received from `peer` to the transfer it belongs
    /// to. `RequestDownload` is not handled here: resolving the local
    /// path of the requested file is the collaborator's job (see
    /// [`TransferManager::request_upload`]).
    pub async fn handle_message(self: &Arc<Self>, peer: &PeerId, message: TransferMessage) {
        match message {
            // Upload side
            TransferMessage::RequestPart(request) => {
                if let Some(upload) = self.upload_for(&request.file, peer).await {
                    if let Err(err) = upload.enqueue_part_request(request) {
                        warn!("Dropping upload to {}: {}", peer, err);
                        upload.abort();
                        let _ = self.internal_tx.send(TransferEvent::UploadBroken {
                            file: upload.file().clone(),
                            peer: peer.clone(),
                            problem: err.problem(),
                            detail: err.to_string(),
                        });
                    }
                }
            }
            TransferMessage::RequestPartsRecord { file } => {
                if let Some(upload) = self.upload_for(&file, peer).await {
                    if let Err(err) = upload.enqueue_record_request() {
                        warn!("Dropping upload to {}: {}", peer, err);
                        upload.abort();
                        let _ = self.internal_tx.send(TransferEvent::UploadBroken {
                            file: upload.file().clone(),
                            peer: peer.clone(),
                            problem: err.problem(),
                            detail: err.to_string(),
                        });
                    }
                }
            }
            TransferMessage::StopUpload { file } => {
                if let Some(upload) = self.upload_for(&file, peer).await {
                    upload.stop();
                }
            }
            TransferMessage::AbortDownload { file } => {
                // The downloader gives up: stop serving it
                if let Some(upload) = self.upload_for(&file, peer).await {
                    upload.abort();
                }
            }

            // Download side
            TransferMessage::FileChunk(chunk) => {
                if let Some(manager) = self.download_manager(&chunk.file).await {
                    manager.received_chunk(peer, chunk).await;
                }
            }
            TransferMessage::PartsRecordReply { file, record } => {
                if let Some(manager) = self.download_manager(&file).await {
                    manager.received_parts_record(peer, record).await;
                }
            }
            TransferMessage::DownloadQueued { file } => {
                if let Some(manager) = self.download_manager(&file).await {
                    manager.set_queued(peer).await;
                }
            }
            TransferMessage::AbortUpload { file } => {
                // The uploader stops serving: drop that source
                if let Some(manager) = self.download_manager(&file).await {
                    manager.remove_source(peer).await;
                }
            }
            TransferMessage::RequestDownload { file, .. } => {
                debug!(
                    "RequestDownload for {} must be resolved by the collaborator",
                    file
                );
            }
        }
    }

    // ==================== persistence ====================

    /// Persist pending downloads to `path` from now on, and load any
    /// previously saved ones.
    pub async fn restore_pending(self: &Arc<Self>, path: PathBuf) {
        let loaded: Vec<PendingDownload> = std::fs::read(&path)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default();
        *self.pending_path.lock().unwrap() = Some(path);
        if !loaded.is_empty() {
            info!("Restored {} pending downloads", loaded.len());
            let mut state = self.state.lock().await;
            for pending in loaded {
                if !state.pending.iter().any(|p| p.file.name == pending.file.name) {
                    state.pending.push(pending);
                }
            }
        }
    }

    fn save_pending(&self, pending: &[PendingDownload]) {
        let path = self.pending_path.lock().unwrap().clone();
        if let Some(path) = path {
            match serde_json::to_vec_pretty(pending) {
                Ok(raw) => {
                    if let Err(e) = std::fs::write(&path, raw) {
                        warn!("Couldn't save pending downloads: {}", e);
                    }
                }
                Err(e) => warn!("Couldn't serialize pending downloads: {}", e),
            }
        }
    }

    // ==================== event bookkeeping ====================

    async fn handle_event(self: &Arc<Self>, event: &TransferEvent) {
        match event {
            TransferEvent::DownloadCompleted { file, .. }
            | TransferEvent::DownloadAborted { file } => {
                let mut state = self.state.lock().await;
                state.managers.remove(&file.name);
            }
            TransferEvent::DownloadBroken {
                file,
                problem,
                automatic,
                ..
            } => {
                let mut state = self.state.lock().await;
                state.managers.remove(&file.name);
                // Automatic downloads are dropped outright: re-queuing
                // them would retry-storm permanently unreachable content
                if !*automatic && problem.is_retryable() {
                    if !state.pending.iter().any(|p| p.file.name == file.name) {
                        state.pending.push(PendingDownload {
                            file: file.clone(),
                            automatic: *automatic,
                        });
                    }
                    self.save_pending(&state.pending);
                }
            }
            TransferEvent::UploadCompleted { file, peer }
            | TransferEvent::UploadAborted { file, peer }
            | TransferEvent::UploadBroken { file, peer, .. } => {
                let mut state = self.state.lock().await;
                // Match the upload that actually ended. A superseded
                // upload's terminal event must not evict its replacement,
                // so the file+peer lookup also requires a dead worker.
                let ended = state
                    .active_uploads
                    .iter()
                    .chain(state.queued_uploads.iter())
                    .find(|u| {
                        u.file().is_same_version(file)
                            && u.peer_id() == peer
                            && (u.is_finished() || u.is_aborted())
                    })
                    .cloned();
                if let Some(ended) = ended {
                    state.active_uploads.retain(|u| !Arc::ptr_eq(u, &ended));
                    state.queued_uploads.retain(|u| !Arc::ptr_eq(u, &ended));
                }
                // A slot freed up: promote the next queued upload
                while state.active_uploads.len() < self.config.max_concurrent_uploads {
                    let Some(next) = state.queued_uploads.first().cloned() else {
                        break;
                    };
                    state.queued_uploads.remove(0);
                    debug!("Starting queued upload of {} to {}", next.file(), next.peer_id());
                    state.active_uploads.push(next.clone());
                    tokio::spawn(next.run(self.internal_tx.clone()));
                }
            }
            _ => {}
        }
    }
}

fn remove_upload(
    uploads: &mut Vec<Arc<Upload>>,
    file: &FileDescriptor,
    peer: &PeerId,
) -> Option<Arc<Upload>> {
    let index = uploads
        .iter()
        .position(|u| u.file().is_same_version(file) && u.peer_id() == peer)?;
    Some(uploads.remove(index))
}
