//! Address discovery: GETADDR/ADDR policy and anchor persistence
//!
//! Sits on top of the address table and implements the relay policies that
//! make address gossip safe to serve:
//! - one getaddr reply per connection, inbound side only
//! - replies are re-shuffled per call so repeated requests cannot map the
//!   table's internal order
//! - echo suppression: a peer never gets back addresses it just told us
//! - the requester's own address is never included
//!
//! Also owns anchors.json: the two oldest outbound peers persisted at
//! shutdown and redialed (with NoBan) at startup to resist eclipse attacks.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;

use tracing::{debug, info, trace};

use crate::types::now;

use super::addrman::AddrMan;
use super::peer_manager::PeerManager;
use super::types::{
    ADDR_ECHO_SUPPRESSION_SECS, MAX_ADDR_SIZE, MAX_ANCHORS, NetworkAddress, PeerId,
    TimestampedAddress,
};

/// Composition of the last getaddr reply, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveryStats {
    pub last_from_recent: usize,
    pub last_from_addrman: usize,
    pub last_from_learned: usize,
    pub getaddr_ignored: u32,
}

pub struct DiscoveryManager {
    pub addrman: AddrMan,
    /// Peers whose one getaddr reply has been spent.
    getaddr_served: HashSet<PeerId>,
    /// addr gossip we ingested, per announcing peer: address -> when.
    learned: HashMap<PeerId, HashMap<SocketAddr, i64>>,
    stats: DiscoveryStats,
    rng: ChaCha20Rng,
}

impl DiscoveryManager {
    pub fn new() -> Self {
        Self {
            addrman: AddrMan::new(),
            getaddr_served: HashSet::new(),
            learned: HashMap::new(),
            stats: DiscoveryStats::default(),
            rng: ChaCha20Rng::from_entropy(),
        }
    }

    pub fn stats(&self) -> DiscoveryStats {
        self.stats
    }

    // -------------------------------------------------------------------------
    // GETADDR
    // -------------------------------------------------------------------------

    /// Build the addr reply for a getaddr from `peer_id`, or None when
    /// policy says to stay silent.
    pub fn handle_getaddr(
        &mut self,
        peers: &PeerManager,
        peer_id: PeerId,
    ) -> Option<Vec<TimestampedAddress>> {
        let peer = peers.get(peer_id)?;
        // Router recheck; the handshake gate normally catches this first
        if !peer.is_ready() {
            self.stats.getaddr_ignored += 1;
            return None;
        }
        // We sent the getaddr on connections we opened; a request coming
        // back on one is either confusion or table scraping
        if !peer.is_inbound() {
            self.stats.getaddr_ignored += 1;
            trace!(peer = peer_id, "ignoring getaddr on outbound connection");
            return None;
        }
        if !self.getaddr_served.insert(peer_id) {
            self.stats.getaddr_ignored += 1;
            trace!(peer = peer_id, "ignoring repeated getaddr");
            return None;
        }

        let requester_addr = peer.address();
        let cutoff = now() - ADDR_ECHO_SUPPRESSION_SECS;
        let suppressed: HashSet<SocketAddr> = self
            .learned
            .get(&peer_id)
            .map(|m| {
                m.iter()
                    .filter(|&(_, &when)| when >= cutoff)
                    .map(|(addr, _)| *addr)
                    .collect()
            })
            .unwrap_or_default();

        let mut seen: HashSet<SocketAddr> = HashSet::new();
        let mut response: Vec<NetworkAddress> = Vec::new();
        let now_ts = now() as u32;

        // Source 1: addresses of peers we are connected to right now
        let mut from_recent = 0usize;
        for other in peers.iter() {
            if other.id == peer_id || !other.is_ready() {
                continue;
            }
            let addr = other.address();
            if addr == requester_addr || suppressed.contains(&addr) {
                continue;
            }
            if seen.insert(addr) {
                response.push(NetworkAddress::from_socket_addr(addr, other.remote_services));
                from_recent += 1;
            }
        }

        // Source 2: gossip recently learned from other peers
        let mut from_learned = 0usize;
        for (&source_peer, entries) in &self.learned {
            if source_peer == peer_id {
                continue;
            }
            for (&addr, &when) in entries {
                if when < cutoff || addr == requester_addr || suppressed.contains(&addr) {
                    continue;
                }
                if seen.insert(addr) {
                    response.push(NetworkAddress::from_socket_addr(addr, 0));
                    from_learned += 1;
                }
            }
        }

        // Source 3: the address table
        let mut from_addrman = 0usize;
        for addr in self.addrman.sample(MAX_ADDR_SIZE) {
            if response.len() >= MAX_ADDR_SIZE {
                break;
            }
            let sock = addr.socket_addr();
            if sock == requester_addr || suppressed.contains(&sock) {
                continue;
            }
            if seen.insert(sock) {
                response.push(addr);
                from_addrman += 1;
            }
        }

        // Shuffle per call: response order must not be stable across
        // requests or it leaks table topology
        for i in (1..response.len()).rev() {
            let j = self.rng.gen_range(0..=i);
            response.swap(i, j);
        }
        response.truncate(MAX_ADDR_SIZE);

        self.stats.last_from_recent = from_recent;
        self.stats.last_from_learned = from_learned;
        self.stats.last_from_addrman = from_addrman;

        debug!(
            peer = peer_id,
            total = response.len(),
            from_recent,
            from_learned,
            from_addrman,
            "serving getaddr"
        );
        Some(
            response
                .into_iter()
                .map(|address| TimestampedAddress { timestamp: now_ts, address })
                .collect(),
        )
    }

    // -------------------------------------------------------------------------
    // ADDR
    // -------------------------------------------------------------------------

    /// Ingest an addr message from `peer_id`. The count cap was enforced at
    /// decode; everything here is per-address filtering.
    pub fn handle_addr(&mut self, peer_id: PeerId, source: SocketAddr, addrs: &[TimestampedAddress]) {
        let now_s = now();
        let learned = self.learned.entry(peer_id).or_default();
        let mut added = 0usize;
        for entry in addrs {
            let sock = entry.address.socket_addr();
            // Echo-suppression record: everything the peer announced counts,
            // routable or not
            learned.insert(sock, now_s);
            if self
                .addrman
                .add(entry.address.clone(), entry.timestamp as i64, Some(source))
            {
                added += 1;
            }
        }
        trace!(peer = peer_id, received = addrs.len(), added, "processed addr message");
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub fn on_peer_disconnected(&mut self, peer_id: PeerId) {
        self.getaddr_served.remove(&peer_id);
        self.learned.remove(&peer_id);
    }

    /// Drop expired echo records and stale table entries.
    pub fn sweep(&mut self) {
        let cutoff = now() - ADDR_ECHO_SUPPRESSION_SECS;
        for entries in self.learned.values_mut() {
            entries.retain(|_, &mut when| when >= cutoff);
        }
        self.learned.retain(|_, entries| !entries.is_empty());
        self.addrman.expire();
    }
}

impl Default for DiscoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// ANCHORS
// =============================================================================

/// On-disk anchors document.
#[derive(Debug, Serialize, Deserialize)]
struct AnchorsDocument {
    version: u32,
    count: usize,
    anchors: Vec<NetworkAddress>,
}

/// Persist up to MAX_ANCHORS addresses at shutdown.
pub fn save_anchors<P: AsRef<Path>>(path: P, anchors: &[NetworkAddress]) -> std::io::Result<()> {
    let doc = AnchorsDocument {
        version: 1,
        count: anchors.len().min(MAX_ANCHORS),
        anchors: anchors.iter().take(MAX_ANCHORS).cloned().collect(),
    };
    let data = serde_json::to_vec_pretty(&doc)?;
    std::fs::write(&path, data)?;
    info!(count = doc.count, "saved anchors");
    Ok(())
}

/// Load anchors and delete the file: a crash before the next clean
/// shutdown must not redial the same set forever.
pub fn load_anchors<P: AsRef<Path>>(path: P) -> Vec<NetworkAddress> {
    let Ok(data) = std::fs::read(&path) else {
        return Vec::new();
    };
    let doc: AnchorsDocument = match serde_json::from_slice(&data) {
        Ok(doc) => doc,
        Err(err) => {
            debug!(%err, "ignoring corrupt anchors file");
            let _ = std::fs::remove_file(&path);
            return Vec::new();
        }
    };
    let _ = std::fs::remove_file(&path);
    if doc.version != 1 {
        return Vec::new();
    }
    let mut anchors = doc.anchors;
    anchors.truncate(MAX_ANCHORS);
    info!(count = anchors.len(), "loaded anchors");
    anchors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::peer::Peer;
    use crate::net::transport::{Transport, TransportEvent};
    use crate::net::types::{ConnectionType, MAINNET_MAGIC, NODE_NETWORK, NetPermissionFlags, localhost};
    use tokio::sync::mpsc;

    async fn ready_peer_manager(inbound: usize) -> (PeerManager, Vec<PeerId>) {
        let mut pm = PeerManager::new(vec![]);
        let mut ids = Vec::new();
        for _ in 0..inbound {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut transport = Transport::new(tx.clone());
            let port = transport.listen(0).await.unwrap();
            transport.connect(1, localhost(port));
            let conn = loop {
                if let TransportEvent::ConnectResult { conn, .. } = rx.recv().await.unwrap() {
                    break conn.unwrap();
                }
            };
            std::mem::forget(transport);
            std::mem::forget(rx);
            let id = pm.next_id();
            let mut peer = Peer::new(id, conn, ConnectionType::Inbound, NetPermissionFlags::NONE, MAINNET_MAGIC);
            // Drive straight to READY for policy tests
            force_ready(&mut peer);
            pm.insert(peer);
            ids.push(id);
        }
        (pm, ids)
    }

    fn force_ready(peer: &mut Peer) {
        use crate::net::message::VersionPayload;
        let payload = VersionPayload {
            version: 1,
            services: NODE_NETWORK,
            timestamp: 0,
            addr_recv: NetworkAddress::new("127.0.0.1".parse().unwrap(), 1, 0),
            addr_from: NetworkAddress::new("127.0.0.1".parse().unwrap(), 2, 0),
            nonce: rand::random(),
            user_agent: "/test/".into(),
            start_height: 0,
        };
        peer.send_message(&crate::net::message::Message::Version(payload.clone()));
        peer.record_version(&payload).unwrap();
        peer.send_message(&crate::net::message::Message::Verack);
        peer.record_verack();
    }

    fn public(a: u8, b: u8) -> TimestampedAddress {
        TimestampedAddress {
            timestamp: now() as u32,
            address: NetworkAddress::new(format!("{a}.{b}.1.1").parse().unwrap(), 18388, NODE_NETWORK),
        }
    }

    #[tokio::test]
    async fn test_getaddr_served_once_per_connection() {
        let (pm, ids) = ready_peer_manager(1).await;
        let mut disc = DiscoveryManager::new();
        disc.addrman.add(public(20, 1).address, now(), None);

        assert!(disc.handle_getaddr(&pm, ids[0]).is_some());
        assert!(disc.handle_getaddr(&pm, ids[0]).is_none());
        assert_eq!(disc.stats().getaddr_ignored, 1);

        // Reconnection resets the served flag
        disc.on_peer_disconnected(ids[0]);
        assert!(disc.handle_getaddr(&pm, ids[0]).is_some());
    }

    #[tokio::test]
    async fn test_getaddr_ignored_pre_ready_and_outbound() {
        let (mut pm, ids) = ready_peer_manager(1).await;
        let mut disc = DiscoveryManager::new();

        // Outbound: we asked them, not the reverse
        pm.get_mut(ids[0]).unwrap().conn_type = ConnectionType::Outbound;
        assert!(disc.handle_getaddr(&pm, ids[0]).is_none());
        assert_eq!(disc.stats().getaddr_ignored, 1);
    }

    #[tokio::test]
    async fn test_echo_suppression() {
        let (pm, ids) = ready_peer_manager(1).await;
        let mut disc = DiscoveryManager::new();

        let echoed = public(30, 1);
        disc.handle_addr(ids[0], pm.get(ids[0]).unwrap().address(), &[echoed.clone()]);
        disc.addrman.add(public(31, 1).address, now(), None);

        let reply = disc.handle_getaddr(&pm, ids[0]).unwrap();
        assert!(
            reply.iter().all(|a| a.address.socket_addr() != echoed.address.socket_addr()),
            "peer must not get back an address it announced within the TTL"
        );
        assert!(reply.iter().any(|a| a.address.socket_addr() == public(31, 1).address.socket_addr()));
    }

    #[tokio::test]
    async fn test_requester_not_included() {
        let (pm, ids) = ready_peer_manager(2).await;
        let mut disc = DiscoveryManager::new();
        let requester_addr = pm.get(ids[0]).unwrap().address();
        let reply = disc.handle_getaddr(&pm, ids[0]).unwrap();
        assert!(reply.iter().all(|a| a.address.socket_addr() != requester_addr));
        // The other connected peer is offered (recent source)
        assert!(disc.stats().last_from_recent >= 1);
    }

    #[tokio::test]
    async fn test_addr_ingestion_updates_table() {
        let (pm, ids) = ready_peer_manager(1).await;
        let mut disc = DiscoveryManager::new();
        let source = pm.get(ids[0]).unwrap().address();
        disc.handle_addr(ids[0], source, &[public(40, 1), public(41, 1)]);
        assert_eq!(disc.addrman.len(), 2);
    }

    #[test]
    fn test_anchors_roundtrip_and_delete_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anchors.json");

        let anchors = vec![
            NetworkAddress::new("8.8.8.8".parse().unwrap(), 18388, NODE_NETWORK),
            NetworkAddress::new("9.9.9.9".parse().unwrap(), 18388, NODE_NETWORK),
            NetworkAddress::new("7.7.7.7".parse().unwrap(), 18388, NODE_NETWORK),
        ];
        save_anchors(&path, &anchors).unwrap();

        // Document is valid JSON with the expected shape
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["count"], 2);
        assert_eq!(raw["anchors"].as_array().unwrap().len(), 2);

        let loaded = load_anchors(&path);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], anchors[0]);
        // Deleted on successful load
        assert!(!path.exists());
        assert!(load_anchors(&path).is_empty());
    }

    #[test]
    fn test_corrupt_anchors_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anchors.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(load_anchors(&path).is_empty());
        assert!(!path.exists());
    }
}
