//! Address table with keyed bucket placement
//!
//! Known peer addresses live in two tables: `new` (heard about, never
//! verified) and `tried` (we connected successfully at least once). Bucket
//! positions are SipHash-keyed with a per-instance random key so a remote
//! announcer cannot predict — and therefore cannot target — which existing
//! entries its addresses would displace.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use siphasher::sip::SipHasher24;
use std::collections::{HashMap, HashSet};
use std::hash::Hasher;
use std::net::{IpAddr, SocketAddr};

use crate::types::now;

use super::types::NetworkAddress;

const NEW_BUCKET_COUNT: usize = 1024;
const TRIED_BUCKET_COUNT: usize = 256;
const BUCKET_SIZE: usize = 64;
const MAX_RETRIES: u32 = 3;
const HORIZON_DAYS: i64 = 30;

/// Address entry with connection history.
#[derive(Debug, Clone)]
pub struct AddressInfo {
    pub addr: NetworkAddress,
    /// Last time the announcer claimed this address was alive.
    pub announced_at: i64,
    pub last_success: i64,
    pub last_attempt: i64,
    /// Consecutive failures since the last success.
    pub attempts: u32,
    /// Who told us (for bucket diversity).
    pub source: Option<SocketAddr>,
}

impl AddressInfo {
    fn new(addr: NetworkAddress, announced_at: i64, source: Option<SocketAddr>) -> Self {
        Self { addr, announced_at, last_success: 0, last_attempt: 0, attempts: 0, source }
    }

    pub fn mark_attempt(&mut self) {
        self.last_attempt = now();
        self.attempts += 1;
    }

    pub fn mark_success(&mut self) {
        self.last_success = now();
        self.attempts = 0;
    }

    /// Deprioritization heuristic: future-dated claims, repeated recent
    /// failures, never-successful retries, or month-old staleness.
    pub fn is_terrible(&self) -> bool {
        let now = now();
        if self.announced_at > now.saturating_add(600) {
            return true;
        }
        if self.last_attempt > 0 && self.last_attempt > now.saturating_sub(60) {
            return self.attempts >= MAX_RETRIES;
        }
        if self.last_success == 0 && self.attempts >= MAX_RETRIES {
            return true;
        }
        if self.announced_at < now.saturating_sub(HORIZON_DAYS * 24 * 60 * 60) {
            return true;
        }
        false
    }
}

/// Bucketed new/tried address table.
pub struct AddrMan {
    key: [u8; 32],
    new_table: Vec<Option<usize>>,
    tried_table: Vec<Option<usize>>,
    addrs: HashMap<usize, AddressInfo>,
    addr_to_idx: HashMap<SocketAddr, usize>,
    next_idx: usize,
    new_count: usize,
    tried_count: usize,
    /// Currently connected, excluded from selection.
    connected: HashSet<SocketAddr>,
    rng: ChaCha20Rng,
}

impl AddrMan {
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill(&mut key);
        Self::with_key(key, ChaCha20Rng::from_entropy())
    }

    /// Deterministic construction for tests.
    pub fn with_key(key: [u8; 32], rng: ChaCha20Rng) -> Self {
        Self {
            key,
            new_table: vec![None; NEW_BUCKET_COUNT * BUCKET_SIZE],
            tried_table: vec![None; TRIED_BUCKET_COUNT * BUCKET_SIZE],
            addrs: HashMap::new(),
            addr_to_idx: HashMap::new(),
            next_idx: 0,
            new_count: 0,
            tried_count: 0,
            connected: HashSet::new(),
            rng,
        }
    }

    /// Add a heard-about address to the new table.
    pub fn add(&mut self, addr: NetworkAddress, announced_at: i64, source: Option<SocketAddr>) -> bool {
        let socket_addr = addr.socket_addr();
        if self.addr_to_idx.contains_key(&socket_addr) {
            // Refresh the freshness claim on re-announcement
            if let Some(&idx) = self.addr_to_idx.get(&socket_addr) {
                if let Some(info) = self.addrs.get_mut(&idx) {
                    if announced_at > info.announced_at && announced_at <= now() + 600 {
                        info.announced_at = announced_at;
                    }
                }
            }
            return false;
        }
        if !addr.is_routable() {
            return false;
        }
        // Future-dated claims poison freshness ordering; cap at +10 min skew
        if announced_at > now().saturating_add(600) {
            return false;
        }

        let bucket = self.new_bucket(&socket_addr, source.as_ref());
        let pos = self.bucket_position(&socket_addr, bucket, true);
        let slot = bucket * BUCKET_SIZE + pos;

        if let Some(existing_idx) = self.new_table[slot] {
            match self.addrs.get(&existing_idx) {
                Some(existing) if !existing.is_terrible() => return false,
                _ => self.remove_from_new(existing_idx),
            }
        }

        let idx = self.next_idx;
        self.next_idx += 1;
        self.addrs.insert(idx, AddressInfo::new(addr, announced_at, source));
        self.addr_to_idx.insert(socket_addr, idx);
        self.new_table[slot] = Some(idx);
        self.new_count += 1;
        true
    }

    /// Seed address: bypasses the routable filter so loopback fixtures and
    /// operator-supplied seeds work.
    pub fn add_seed(&mut self, addr: NetworkAddress) -> bool {
        let socket_addr = addr.socket_addr();
        if self.addr_to_idx.contains_key(&socket_addr) {
            return false;
        }
        let bucket = self.new_bucket(&socket_addr, None);
        let pos = self.bucket_position(&socket_addr, bucket, true);
        let slot = bucket * BUCKET_SIZE + pos;
        if let Some(existing_idx) = self.new_table[slot] {
            self.remove_from_new(existing_idx);
        }
        let idx = self.next_idx;
        self.next_idx += 1;
        self.addrs.insert(idx, AddressInfo::new(addr, now(), None));
        self.addr_to_idx.insert(socket_addr, idx);
        self.new_table[slot] = Some(idx);
        self.new_count += 1;
        true
    }

    /// Successful connection: promote into the tried table.
    pub fn mark_good(&mut self, addr: &SocketAddr) {
        let Some(&idx) = self.addr_to_idx.get(addr) else { return };
        if let Some(info) = self.addrs.get_mut(&idx) {
            info.mark_success();
        }
        if self.is_in_tried(idx) {
            return;
        }
        self.remove_from_new(idx);

        let bucket = self.tried_bucket(addr);
        let pos = self.bucket_position(addr, bucket, false);
        let slot = bucket * BUCKET_SIZE + pos;
        if let Some(existing_idx) = self.tried_table[slot] {
            self.demote_to_new(existing_idx);
        }
        self.tried_table[slot] = Some(idx);
        self.tried_count += 1;
    }

    pub fn mark_attempt(&mut self, addr: &SocketAddr) {
        if let Some(&idx) = self.addr_to_idx.get(addr) {
            if let Some(info) = self.addrs.get_mut(&idx) {
                info.mark_attempt();
            }
        }
    }

    pub fn mark_connected(&mut self, addr: &SocketAddr) {
        self.connected.insert(*addr);
    }

    pub fn mark_disconnected(&mut self, addr: &SocketAddr) {
        self.connected.remove(addr);
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.addr_to_idx.contains_key(addr)
    }

    /// Pick a connect candidate. 50/50 new vs tried, falling back to
    /// whichever table has entries; `new_only` restricts to the new table
    /// (feeler selection).
    pub fn select(&mut self, new_only: bool) -> Option<NetworkAddress> {
        let use_new = new_only || self.rng.gen_bool(0.5);
        if use_new && self.new_count > 0 {
            self.select_from(true)
        } else if !new_only && self.tried_count > 0 {
            self.select_from(false)
        } else if self.new_count > 0 {
            self.select_from(true)
        } else {
            None
        }
    }

    fn select_from(&mut self, from_new: bool) -> Option<NetworkAddress> {
        let (table_len, count) = if from_new {
            (self.new_table.len(), self.new_count)
        } else {
            (self.tried_table.len(), self.tried_count)
        };
        if count == 0 {
            return None;
        }

        // Sparse tables: scan directly, random probing would mostly miss
        if count <= 10 {
            for slot in 0..table_len {
                let entry = if from_new { self.new_table[slot] } else { self.tried_table[slot] };
                if let Some(idx) = entry {
                    if let Some(addr) = self.eligible(idx) {
                        return Some(addr);
                    }
                }
            }
            return None;
        }

        for _ in 0..1000 {
            let slot = self.rng.gen_range(0..table_len);
            let entry = if from_new { self.new_table[slot] } else { self.tried_table[slot] };
            if let Some(idx) = entry {
                if let Some(addr) = self.eligible(idx) {
                    return Some(addr);
                }
            }
        }
        None
    }

    fn eligible(&self, idx: usize) -> Option<NetworkAddress> {
        let info = self.addrs.get(&idx)?;
        let socket_addr = info.addr.socket_addr();
        if self.connected.contains(&socket_addr) {
            return None;
        }
        if info.is_terrible() || info.attempts >= MAX_RETRIES {
            return None;
        }
        Some(info.addr.clone())
    }

    /// Random sample for addr replies, tried entries first, shuffled with
    /// the instance RNG so consecutive calls differ.
    pub fn sample(&mut self, max_count: usize) -> Vec<NetworkAddress> {
        let mut result: Vec<NetworkAddress> = Vec::with_capacity(max_count.min(self.addrs.len()));
        let tried_target = (max_count as f64 * 0.7) as usize;

        for (idx, info) in &self.addrs {
            if result.len() >= tried_target {
                break;
            }
            if self.is_in_tried(*idx) && !info.is_terrible() {
                result.push(info.addr.clone());
            }
        }
        for info in self.addrs.values() {
            if result.len() >= max_count {
                break;
            }
            if !info.is_terrible() && !result.contains(&info.addr) {
                result.push(info.addr.clone());
            }
        }

        for i in (1..result.len()).rev() {
            let j = self.rng.gen_range(0..=i);
            result.swap(i, j);
        }
        result.truncate(max_count);
        result
    }

    /// Drop stale never-successful entries.
    pub fn expire(&mut self) {
        let horizon = now().saturating_sub(HORIZON_DAYS * 24 * 60 * 60);
        let stale: Vec<SocketAddr> = self
            .addrs
            .values()
            .filter(|info| info.announced_at < horizon && info.last_success == 0)
            .map(|info| info.addr.socket_addr())
            .collect();
        for addr in stale {
            self.remove(&addr);
        }
    }

    pub fn remove(&mut self, addr: &SocketAddr) {
        let Some(&idx) = self.addr_to_idx.get(addr) else { return };
        self.remove_from_new(idx);
        for slot in self.tried_table.iter_mut() {
            if *slot == Some(idx) {
                *slot = None;
                self.tried_count = self.tried_count.saturating_sub(1);
                break;
            }
        }
        self.addrs.remove(&idx);
        self.addr_to_idx.remove(addr);
    }

    pub fn size(&self) -> (usize, usize) {
        (self.new_count, self.tried_count)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    // -------------------------------------------------------------------------
    // Bucket math
    // -------------------------------------------------------------------------

    fn new_bucket(&self, addr: &SocketAddr, source: Option<&SocketAddr>) -> usize {
        let mut hasher = SipHasher24::new_with_key(&self.key[..16].try_into().unwrap());
        hasher.write(&netgroup_bytes(addr));
        if let Some(src) = source {
            hasher.write(&netgroup_bytes(src));
        }
        (hasher.finish() as usize) % NEW_BUCKET_COUNT
    }

    fn tried_bucket(&self, addr: &SocketAddr) -> usize {
        let mut hasher = SipHasher24::new_with_key(&self.key[..16].try_into().unwrap());
        hasher.write(&addr_bytes(addr));
        hasher.write(&netgroup_bytes(addr));
        (hasher.finish() as usize) % TRIED_BUCKET_COUNT
    }

    fn bucket_position(&self, addr: &SocketAddr, bucket: usize, is_new: bool) -> usize {
        let mut hasher = SipHasher24::new_with_key(&self.key[16..].try_into().unwrap());
        hasher.write(&addr_bytes(addr));
        hasher.write(&bucket.to_le_bytes());
        hasher.write(&[is_new as u8]);
        (hasher.finish() as usize) % BUCKET_SIZE
    }

    fn is_in_tried(&self, idx: usize) -> bool {
        self.tried_table.contains(&Some(idx))
    }

    fn remove_from_new(&mut self, idx: usize) {
        for slot in self.new_table.iter_mut() {
            if *slot == Some(idx) {
                *slot = None;
                self.new_count = self.new_count.saturating_sub(1);
                return;
            }
        }
    }

    /// Tried-slot collision: the displaced entry goes back to new.
    fn demote_to_new(&mut self, idx: usize) {
        for slot in self.tried_table.iter_mut() {
            if *slot == Some(idx) {
                *slot = None;
                self.tried_count = self.tried_count.saturating_sub(1);
                break;
            }
        }
        if let Some(info) = self.addrs.get(&idx) {
            let socket_addr = info.addr.socket_addr();
            let source = info.source;
            let bucket = self.new_bucket(&socket_addr, source.as_ref());
            let pos = self.bucket_position(&socket_addr, bucket, true);
            let slot = bucket * BUCKET_SIZE + pos;
            if self.new_table[slot].is_none() {
                self.new_table[slot] = Some(idx);
                self.new_count += 1;
            }
        }
    }
}

impl Default for AddrMan {
    fn default() -> Self {
        Self::new()
    }
}

/// /16 netgroup key, the unit of bucket diversity.
fn netgroup_bytes(addr: &SocketAddr) -> [u8; 4] {
    match addr.ip() {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], 0, 0]
        }
        IpAddr::V6(ip) => {
            let segments = ip.segments();
            [
                (segments[0] >> 8) as u8,
                segments[0] as u8,
                (segments[1] >> 8) as u8,
                segments[1] as u8,
            ]
        }
    }
}

fn addr_bytes(addr: &SocketAddr) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(19);
    match addr.ip() {
        IpAddr::V4(ip) => {
            bytes.push(4);
            bytes.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            bytes.push(6);
            bytes.extend_from_slice(&ip.octets());
        }
    }
    bytes.extend_from_slice(&addr.port().to_le_bytes());
    bytes
}
