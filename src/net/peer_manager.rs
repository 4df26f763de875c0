//! Peer registry, admission control, bans, and per-peer tracking data
//!
//! Owns every connected Peer plus the stores that outlive individual
//! connections: the persistent ban list, the expiring discouragement set,
//! and the per-peer announcement bookkeeping used by block relay. All
//! mutation happens on the network reactor.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use tracing::{debug, info};

use crate::types::{Hash, now};

use super::peer::Peer;
use super::types::{
    ConnectionType, DEFAULT_BAN_DURATION_SECS, DISCOURAGEMENT_DURATION_SECS, DisconnectReason,
    MAX_ANCHORS, NetPermissionFlags, NetworkAddress, PER_IP_LIMIT, PeerId,
};

/// Serialized ban list size cap: reject oversized files before bincode
/// touches them.
const MAX_BANLIST_FILE_SIZE: u64 = 1024 * 1024;

// =============================================================================
// BAN LIST
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanEntry {
    pub ip: IpAddr,
    pub banned_at: i64,
    pub ban_until: i64,
    pub reason: String,
}

impl BanEntry {
    pub fn new(ip: IpAddr, duration_secs: i64, reason: String) -> Self {
        let now = now();
        Self { ip, banned_at: now, ban_until: now.saturating_add(duration_secs), reason }
    }

    pub fn is_expired(&self) -> bool {
        now() >= self.ban_until
    }
}

/// Persistent address bans. Independent of the whitelist: a whitelisted
/// address can be banned; whitelisting only affects admission checks for
/// discouragement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BanList {
    bans: HashMap<IpAddr, BanEntry>,
}

impl BanList {
    pub fn new() -> Self {
        Self { bans: HashMap::new() }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let data = std::fs::read(&path)?;
        if data.len() as u64 > MAX_BANLIST_FILE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("ban list file too large: {} bytes", data.len()),
            ));
        }
        bincode::deserialize(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let data = bincode::serialize(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, data)
    }

    pub fn ban(&mut self, entry: BanEntry) {
        info!(ip = %entry.ip, until = entry.ban_until, reason = %entry.reason, "banning address");
        self.bans.insert(entry.ip, entry);
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.bans.get(ip).map(|e| !e.is_expired()).unwrap_or(false)
    }

    pub fn unban(&mut self, ip: &IpAddr) -> bool {
        self.bans.remove(ip).is_some()
    }

    pub fn sweep(&mut self) {
        self.bans.retain(|ip, entry| {
            let keep = !entry.is_expired();
            if !keep {
                debug!(%ip, "ban expired");
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }
}

// =============================================================================
// PER-PEER TRACKING DATA
// =============================================================================

/// Announcement bookkeeping that must survive transient Peer borrows.
#[derive(Debug, Clone, Default)]
pub struct PeerTrackingData {
    /// Last tip hash announced to this peer and when we enqueued it.
    pub last_announced: Option<(Hash, i64)>,
    /// Pending INV relay queue, deduplicated on insertion.
    pub inv_queue: Vec<Hash>,
}

// =============================================================================
// PEER MANAGER
// =============================================================================

/// What the reactor needs to know about a peer that just left the registry.
pub struct RemovedPeer {
    pub id: PeerId,
    pub address: std::net::SocketAddr,
    pub conn_type: ConnectionType,
    pub was_sync_peer: bool,
}

pub struct PeerManager {
    peers: HashMap<PeerId, Peer>,
    tracking: HashMap<PeerId, PeerTrackingData>,
    next_peer_id: PeerId,
    ban_list: BanList,
    /// Soft, expiring punishment: addr -> expiry time.
    discouraged: HashMap<IpAddr, i64>,
    whitelist: Vec<IpAddr>,
}

impl PeerManager {
    pub fn new(whitelist: Vec<IpAddr>) -> Self {
        Self {
            peers: HashMap::new(),
            tracking: HashMap::new(),
            next_peer_id: 1,
            ban_list: BanList::new(),
            discouraged: HashMap::new(),
            whitelist,
        }
    }

    // -------------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------------

    /// Allocate the next PeerId. Monotonic, never reused.
    pub fn next_id(&mut self) -> PeerId {
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        id
    }

    pub fn insert(&mut self, peer: Peer) {
        self.tracking.insert(peer.id, PeerTrackingData::default());
        self.peers.insert(peer.id, peer);
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn count(&self) -> usize {
        self.peers.len()
    }

    pub fn outbound_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.conn_type == ConnectionType::Outbound && p.is_connected())
            .count()
    }

    pub fn inbound_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_inbound() && p.is_connected()).count()
    }

    /// Is there already an outbound connection (or one being set up) to
    /// this address? Prevents duplicate dials.
    pub fn has_outbound_to(&self, addr: &std::net::SocketAddr) -> bool {
        self.peers
            .values()
            .any(|p| p.is_outbound() && p.is_connected() && p.address() == *addr)
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.contains(ip)
    }

    /// Inbound admission: banned and (unless whitelisted) discouraged
    /// addresses are refused, and each IP gets at most PER_IP_LIMIT slots.
    pub fn admit_inbound(&self, ip: &IpAddr) -> Result<(), &'static str> {
        if self.ban_list.is_banned(ip) {
            return Err("banned");
        }
        if !self.is_whitelisted(ip) && self.is_discouraged(ip) {
            return Err("discouraged");
        }
        let per_ip = self
            .peers
            .values()
            .filter(|p| p.is_connected() && p.address().ip() == *ip)
            .count();
        if per_ip >= PER_IP_LIMIT {
            return Err("per-ip limit");
        }
        Ok(())
    }

    /// Default permissions for an admitted inbound peer.
    pub fn inbound_permissions(&self, ip: &IpAddr) -> NetPermissionFlags {
        if self.is_whitelisted(ip) {
            NetPermissionFlags::NOBAN
        } else {
            NetPermissionFlags::NONE
        }
    }

    /// Nonce collision check against our own nonce and every connected
    /// peer's remote nonce. Catches self-connections and duplicate links.
    pub fn check_incoming_nonce(&self, nonce: u64, local_nonce: u64) -> bool {
        if nonce == local_nonce {
            return false;
        }
        !self
            .peers
            .values()
            .any(|p| p.is_connected() && p.remote_nonce != 0 && p.remote_nonce == nonce)
    }

    // -------------------------------------------------------------------------
    // Misbehavior / bans / discouragement
    // -------------------------------------------------------------------------

    /// Apply misbehavior points; on crossing the threshold, discourage the
    /// address and disconnect. Manual connections are never auto-discouraged.
    pub fn misbehave(&mut self, id: PeerId, points: u32, reason: &str) {
        let Some(peer) = self.peers.get_mut(&id) else { return };
        if peer.misbehave(points, reason) {
            let ip = peer.address().ip();
            let manual = peer.conn_type == ConnectionType::Manual;
            peer.disconnect(DisconnectReason::Misbehavior);
            if !manual {
                self.discourage(ip);
            }
        }
    }

    pub fn discourage(&mut self, ip: IpAddr) {
        info!(%ip, "discouraging address");
        self.discouraged
            .insert(ip, now().saturating_add(DISCOURAGEMENT_DURATION_SECS));
    }

    pub fn is_discouraged(&self, ip: &IpAddr) -> bool {
        self.discouraged.get(ip).map(|&until| now() < until).unwrap_or(false)
    }

    pub fn ban(&mut self, ip: IpAddr, duration_secs: Option<i64>, reason: &str) {
        self.ban_list.ban(BanEntry::new(
            ip,
            duration_secs.unwrap_or(DEFAULT_BAN_DURATION_SECS),
            reason.to_string(),
        ));
        // Active connections from the newly banned address drop immediately
        for peer in self.peers.values_mut() {
            if peer.address().ip() == ip {
                peer.disconnect(DisconnectReason::Requested);
            }
        }
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.ban_list.is_banned(ip)
    }

    pub fn load_bans<P: AsRef<Path>>(&mut self, path: P) -> std::io::Result<()> {
        self.ban_list = BanList::load(path)?;
        Ok(())
    }

    pub fn save_bans<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        self.ban_list.save(path)
    }

    /// Sweep expired bans and discouragement entries.
    pub fn sweep_expired(&mut self) {
        self.ban_list.sweep();
        let now = now();
        self.discouraged.retain(|_, &mut until| now < until);
    }

    // -------------------------------------------------------------------------
    // Periodic maintenance
    // -------------------------------------------------------------------------

    /// Ping idle peers and collect peers past their deadlines. Also
    /// harvests peers already at the misbehavior threshold in case a
    /// handler path only scored without disconnecting.
    pub fn process_periodic(&mut self) {
        let now_s = now();
        for peer in self.peers.values_mut() {
            if !peer.is_connected() {
                continue;
            }
            if peer.needs_ping(now_s) {
                peer.send_ping();
            }
            if let Some(reason) = peer.check_timeouts(now_s) {
                peer.disconnect(reason);
                continue;
            }
            if peer.misbehavior_score >= super::types::DISCOURAGE_THRESHOLD
                && !peer.permissions.contains(NetPermissionFlags::NOBAN)
            {
                peer.disconnect(DisconnectReason::Misbehavior);
            }
        }
    }

    /// Remove a peer from the registry. Returns cleanup context; if the
    /// departed peer was the sync peer, `sync_started` is reset on every
    /// remaining peer so reselection can pick any of them.
    pub fn remove(&mut self, id: PeerId) -> Option<RemovedPeer> {
        let peer = self.peers.remove(&id)?;
        self.tracking.remove(&id);
        let was_sync_peer = peer.sync_started;
        if was_sync_peer {
            for other in self.peers.values_mut() {
                other.sync_started = false;
            }
        }
        Some(RemovedPeer {
            id,
            address: peer.address(),
            conn_type: peer.conn_type,
            was_sync_peer,
        })
    }

    /// Disconnect every peer (shutdown path).
    pub fn disconnect_all(&mut self) {
        for peer in self.peers.values_mut() {
            peer.disconnect(DisconnectReason::Shutdown);
        }
    }

    // -------------------------------------------------------------------------
    // Tracking data (block relay bookkeeping)
    // -------------------------------------------------------------------------

    pub fn tracking(&self, id: PeerId) -> Option<&PeerTrackingData> {
        self.tracking.get(&id)
    }

    /// Queue a block for INV relay to a peer. Never enqueues a duplicate.
    pub fn add_block_for_inv_relay(&mut self, id: PeerId, hash: Hash) {
        if let Some(data) = self.tracking.get_mut(&id) {
            if !data.inv_queue.contains(&hash) {
                data.inv_queue.push(hash);
            }
        }
    }

    pub fn remove_block_for_inv_relay(&mut self, id: PeerId, hash: &Hash) {
        if let Some(data) = self.tracking.get_mut(&id) {
            data.inv_queue.retain(|h| h != hash);
        }
    }

    /// Take and clear a peer's pending INV queue.
    pub fn take_blocks_for_inv_relay(&mut self, id: PeerId) -> Vec<Hash> {
        self.tracking
            .get_mut(&id)
            .map(|data| std::mem::take(&mut data.inv_queue))
            .unwrap_or_default()
    }

    pub fn last_announcement(&self, id: PeerId) -> Option<(Hash, i64)> {
        self.tracking.get(&id).and_then(|data| data.last_announced)
    }

    pub fn set_last_announced(&mut self, id: PeerId, hash: Hash, when: i64) {
        if let Some(data) = self.tracking.get_mut(&id) {
            data.last_announced = Some((hash, when));
        }
    }

    // -------------------------------------------------------------------------
    // Anchors
    // -------------------------------------------------------------------------

    /// Pick up to MAX_ANCHORS of the oldest READY full-relay outbound peers
    /// for persistence at shutdown.
    pub fn select_anchors(&self) -> Vec<NetworkAddress> {
        let mut candidates: Vec<&Peer> = self
            .peers
            .values()
            .filter(|p| p.is_ready() && p.conn_type == ConnectionType::Outbound)
            .collect();
        candidates.sort_by_key(|p| p.connected_at);
        candidates
            .iter()
            .take(MAX_ANCHORS)
            .map(|p| NetworkAddress::from_socket_addr(p.address(), p.remote_services))
            .collect()
    }
}
