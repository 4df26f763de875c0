//! Header synchronization coordinator
//!
//! One outbound peer at a time is the designated sync source during initial
//! block download. Batches are gated before they can touch the chainstate:
//!
//! - size cap (defensive; the codec already rejects oversized counts)
//! - IBD gating: large batches only from the sync peer, ≤2-header
//!   announcements from anyone
//! - continuity: the first header must connect to a known header, and the
//!   batch must be internally contiguous; the unconnecting counter resets
//!   only after a batch passes BOTH checks, so alternating orphan/gapped
//!   batches cannot keep the counter pinned at zero
//! - low-work gating: below-threshold batches are never integrated; a
//!   full-sized one asks for more instead (the tail may carry the work),
//!   a short one is dropped as a possibly-honest sparse tip
//!
//! An empty HEADERS is a legitimate "nothing more" and keeps the current
//! sync peer (stickiness). A silent sync peer is cut after 120 s and the
//! disconnect path clears `sync_started` everywhere so reselection can run.

use tracing::{debug, info, trace, warn};

use crate::chain::{ChainState, RejectReason};
use crate::types::{ZERO_HASH, now_us, short_hash};

use super::message::{GetHeadersPayload, Message};
use super::peer_manager::PeerManager;
use super::types::{
    ConnectionType, DisconnectReason, HEADER_SYNC_STALL_TIMEOUT_SECS, MAX_HEADERS_SIZE,
    MAX_LOCATOR_SZ, MAX_UNCONNECTING_HEADERS, MAX_UNSOLICITED_HEADERS, PROTOCOL_VERSION, PeerId,
};

pub struct HeaderSyncManager {
    sync_peer_id: Option<PeerId>,
    sync_start_us: i64,
    last_headers_us: i64,
}

impl HeaderSyncManager {
    pub fn new() -> Self {
        Self { sync_peer_id: None, sync_start_us: 0, last_headers_us: 0 }
    }

    pub fn sync_peer_id(&self) -> Option<PeerId> {
        self.sync_peer_id
    }

    pub fn has_sync_peer(&self) -> bool {
        self.sync_peer_id.is_some()
    }

    pub fn set_sync_peer(&mut self, peers: &mut PeerManager, peer_id: PeerId) {
        if let Some(peer) = peers.get_mut(peer_id) {
            peer.sync_started = true;
        }
        self.sync_peer_id = Some(peer_id);
        self.sync_start_us = now_us();
        self.last_headers_us = now_us();
    }

    pub fn clear_sync_peer(&mut self) {
        self.sync_peer_id = None;
    }

    /// Disconnect hook from the peer registry. The registry has already
    /// reset `sync_started` on the survivors when the sync peer left.
    pub fn on_peer_disconnected(&mut self, peer_id: PeerId) {
        if self.sync_peer_id == Some(peer_id) {
            info!(peer = peer_id, "sync peer disconnected, will reselect");
            self.clear_sync_peer();
        }
    }

    // -------------------------------------------------------------------------
    // Sync peer selection
    // -------------------------------------------------------------------------

    /// Pick a sync peer and kick off header download if we are behind and
    /// none is active. Outbound peers only; lowest id wins so tests are
    /// reproducible.
    pub fn check_initial_sync(&mut self, chain: &ChainState, peers: &mut PeerManager) {
        if self.has_sync_peer() {
            return;
        }
        if !chain.is_initial_block_download() {
            return;
        }
        let candidate = peers
            .iter()
            .filter(|p| {
                p.is_ready()
                    && matches!(p.conn_type, ConnectionType::Outbound | ConnectionType::Manual)
                    && !p.sync_started
            })
            .map(|p| p.id)
            .min();
        let Some(peer_id) = candidate else { return };

        info!(peer = peer_id, height = chain.height(), "starting initial header sync");
        self.set_sync_peer(peers, peer_id);
        self.request_headers_from(chain, peers, peer_id);
    }

    /// Send GETHEADERS to a peer using the pprev-of-tip locator.
    pub fn request_headers_from(&self, chain: &ChainState, peers: &mut PeerManager, peer_id: PeerId) {
        let locator = chain.locator_from_prev();
        self.send_getheaders(peers, peer_id, locator.hashes);
    }

    fn send_getheaders(&self, peers: &mut PeerManager, peer_id: PeerId, locator_hashes: Vec<crate::types::Hash>) {
        let Some(peer) = peers.get_mut(peer_id) else { return };
        trace!(peer = peer_id, locator_len = locator_hashes.len(), "sending getheaders");
        peer.send_message(&Message::GetHeaders(GetHeadersPayload {
            version: PROTOCOL_VERSION as u32,
            locator_hashes,
            stop_hash: ZERO_HASH,
        }));
    }

    // -------------------------------------------------------------------------
    // HEADERS handling
    // -------------------------------------------------------------------------

    pub fn handle_headers(
        &mut self,
        chain: &mut ChainState,
        peers: &mut PeerManager,
        peer_id: PeerId,
        headers: &[crate::chain::BlockHeader],
    ) -> bool {
        // 1. Size cap. The codec rejects this earlier; a batch that still
        // arrives oversized is hostile.
        if headers.len() > MAX_HEADERS_SIZE {
            peers.misbehave(peer_id, 20, "oversized headers batch");
            if let Some(peer) = peers.get_mut(peer_id) {
                peer.disconnect(DisconnectReason::Misbehavior);
            }
            return false;
        }

        // 2. IBD gating: during initial download, large batches are accepted
        // only from the designated sync peer. Small announcements pass.
        let is_sync_peer = self.sync_peer_id == Some(peer_id);
        if chain.is_initial_block_download()
            && headers.len() > MAX_UNSOLICITED_HEADERS
            && !is_sync_peer
        {
            trace!(
                peer = peer_id,
                count = headers.len(),
                "ignoring unsolicited large headers batch during IBD"
            );
            return true;
        }

        // 3. Empty batch: legitimate "nothing more to send". Keeps the sync
        // peer (no reselection) and feeds the stall clock.
        if headers.is_empty() {
            if is_sync_peer {
                self.last_headers_us = now_us();
            }
            return true;
        }

        // 4. Continuity. First header must connect to something we know...
        let first = &headers[0];
        if !chain.have_header(&first.prev_hash) {
            let unconnecting = {
                let Some(peer) = peers.get_mut(peer_id) else { return false };
                peer.unconnecting_headers_count += 1;
                peer.unconnecting_headers_count
            };
            debug!(
                peer = peer_id,
                unconnecting,
                prev = %short_hash(&first.prev_hash),
                "headers batch does not connect"
            );
            if unconnecting >= MAX_UNCONNECTING_HEADERS {
                warn!(peer = peer_id, "too many unconnecting headers, disconnecting");
                if let Some(peer) = peers.get_mut(peer_id) {
                    peer.disconnect(DisconnectReason::Misbehavior);
                }
                return false;
            }
            // Nudge the peer back onto our chain
            self.request_headers_from(chain, peers, peer_id);
            return true;
        }
        // ...and the batch must chain internally. A gapped batch does NOT
        // reset the unconnecting counter: only a fully continuous one does.
        for window in headers.windows(2) {
            if window[1].prev_hash != window[0].hash() {
                peers.misbehave(peer_id, 20, "non-continuous headers batch");
                return false;
            }
        }

        // 5. Anti-DoS low-work gate. Skipped when the batch tail is already
        // on our active chain (re-delivery after a local invalidation).
        let last = headers.last().expect("non-empty batch");
        let skip_work_check = chain.is_on_active_chain(&last.hash());
        if !skip_work_check {
            let batch_work = chain.calculate_headers_work(headers);
            if batch_work < chain.anti_dos_work_threshold() {
                if headers.len() == MAX_HEADERS_SIZE {
                    // Full batch below threshold: the work may be further
                    // along; extend the locator past this batch and ask on
                    debug!(peer = peer_id, "full low-work batch, requesting continuation");
                    let mut locator_hashes = vec![last.hash()];
                    locator_hashes.extend(chain.locator_from_prev().hashes);
                    locator_hashes.truncate(MAX_LOCATOR_SZ);
                    self.send_getheaders(peers, peer_id, locator_hashes);
                } else {
                    trace!(peer = peer_id, count = headers.len(), "dropping low-work batch");
                }
                return true;
            }
        }

        // 6. Integrate.
        match chain.process_new_block_headers(headers) {
            Ok(accepted) => {
                if let Some(peer) = peers.get_mut(peer_id) {
                    peer.unconnecting_headers_count = 0;
                }
                if is_sync_peer {
                    self.last_headers_us = now_us();
                }
                debug!(
                    peer = peer_id,
                    accepted,
                    height = chain.height(),
                    "processed headers batch"
                );
                // Full batch means the peer has more: keep pulling
                if headers.len() == MAX_HEADERS_SIZE {
                    self.request_headers_from(chain, peers, peer_id);
                }
                true
            }
            Err(RejectReason::Invalid) => {
                peers.misbehave(peer_id, 100, "invalid header in batch");
                false
            }
            Err(RejectReason::Unconnected) => {
                // Continuity was pre-checked; an interior orphan here means
                // the tree mutated under us. Treat like an unconnecting batch.
                if let Some(peer) = peers.get_mut(peer_id) {
                    peer.unconnecting_headers_count += 1;
                }
                true
            }
        }
    }

    // -------------------------------------------------------------------------
    // GETHEADERS handling
    // -------------------------------------------------------------------------

    /// Serve a getheaders request: locate the fork point and send up to
    /// 2000 active-chain headers. No common block means an empty HEADERS —
    /// never "everything from genesis".
    pub fn handle_getheaders(
        &mut self,
        chain: &ChainState,
        peers: &mut PeerManager,
        peer_id: PeerId,
        payload: &GetHeadersPayload,
    ) -> bool {
        let locator = crate::chain::BlockLocator { hashes: payload.locator_hashes.clone() };
        let headers = match chain.find_fork(&locator) {
            Some(fork_height) => {
                chain.headers_after(fork_height, &payload.stop_hash, MAX_HEADERS_SIZE)
            }
            None => Vec::new(),
        };
        trace!(peer = peer_id, count = headers.len(), "serving getheaders");
        if let Some(peer) = peers.get_mut(peer_id) {
            peer.send_message(&Message::Headers(headers));
        }
        true
    }

    // -------------------------------------------------------------------------
    // Stall detection
    // -------------------------------------------------------------------------

    /// Cut a sync peer that has gone quiet. Reselection happens through the
    /// regular disconnect path plus the next check_initial_sync tick.
    pub fn process_timers(&mut self, peers: &mut PeerManager) {
        let Some(peer_id) = self.sync_peer_id else { return };
        let stalled_us = now_us() - self.last_headers_us;
        if stalled_us > HEADER_SYNC_STALL_TIMEOUT_SECS * 1_000_000 {
            warn!(
                peer = peer_id,
                stalled_secs = stalled_us / 1_000_000,
                "header sync stalled, dropping sync peer"
            );
            if let Some(peer) = peers.get_mut(peer_id) {
                peer.disconnect(DisconnectReason::Stalling);
            }
        }
    }
}

impl Default for HeaderSyncManager {
    fn default() -> Self {
        Self::new()
    }
}
