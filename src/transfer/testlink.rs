//! In-memory peer link for tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::parts::Range;
use crate::peer::{PeerId, PeerLink, PeerLocality};
use crate::protocol::TransferMessage;

/// A peer link that records every sent message
pub(crate) struct MockLink {
    id: PeerId,
    locality: PeerLocality,
    multi_part: bool,
    delta_sync: bool,
    connected: AtomicBool,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<TransferMessage>>,
}

impl MockLink {
    pub fn new(
        id: &str,
        locality: PeerLocality,
        multi_part: bool,
        delta_sync: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: PeerId::new(id),
            locality,
            multi_part,
            delta_sync,
            connected: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// A LAN peer supporting part requests and delta-sync
    pub fn lan(id: &str) -> Arc<Self> {
        Self::new(id, PeerLocality::Lan, true, true)
    }

    /// A WAN peer supporting part requests and delta-sync
    pub fn wan(id: &str) -> Arc<Self> {
        Self::new(id, PeerLocality::Wan, true, true)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    /// Everything sent through this link so far
    pub fn sent(&self) -> Vec<TransferMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Ranges of all part requests sent through this link
    pub fn sent_part_ranges(&self) -> Vec<Range> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                TransferMessage::RequestPart(req) => Some(req.range),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl PeerLink for MockLink {
    fn peer_id(&self) -> &PeerId {
        &self.id
    }

    fn locality(&self) -> PeerLocality {
        self.locality
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn supports_part_requests(&self) -> bool {
        self.multi_part
    }

    fn supports_delta_sync(&self) -> bool {
        self.delta_sync
    }

    async fn send(&self, message: TransferMessage) -> Result<()> {
        if self.fail_sends.load(Ordering::Relaxed) || !self.is_connected() {
            return Err(anyhow::anyhow!("link down"));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}
