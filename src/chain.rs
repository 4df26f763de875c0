//! In-memory headers chainstate
//!
//! The networking core treats the chainstate as a collaborator: tip lookup,
//! header-tree membership, locators, the IBD predicate, the anti-DoS work
//! threshold, and header acceptance. On a headers-only chain a block IS its
//! 100-byte header, so the whole state fits in a hash-keyed tree plus the
//! active-chain vector.
//!
//! Proof-of-work verification is not performed here; a validity hook lets
//! the embedder (or a test) reject headers, and the tree only enforces
//! structure: connectivity, no duplicates, cumulative-work bookkeeping.

use std::collections::HashMap;

use crate::net::wire::{Reader, WireResult, Writer, double_sha256};
use crate::types::{Hash, Work, ZERO_HASH, now};

/// Serialized size of a block header. Fixed: the wire format carries no
/// per-header varint framing.
pub const BLOCK_HEADER_SIZE: usize = 100;

/// Tip older than this means we are still in initial block download.
pub const DEFAULT_MAX_TIP_AGE_SECS: i64 = 24 * 60 * 60;

// =============================================================================
// BLOCK HEADER
// =============================================================================

/// 100-byte block header. The `extra_nonce` widens the search space for a
/// slow-hash PoW where iterating the 8-byte nonce alone is too narrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u64,
    pub extra_nonce: [u8; 16],
}

impl BlockHeader {
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(BLOCK_HEADER_SIZE);
        self.serialize_into(&mut w);
        w.into_bytes()
    }

    pub fn serialize_into(&self, w: &mut Writer) {
        w.write_i32(self.version);
        w.write_bytes(&self.prev_hash);
        w.write_bytes(&self.merkle_root);
        w.write_u32(self.timestamp);
        w.write_u32(self.bits);
        w.write_u64(self.nonce);
        w.write_bytes(&self.extra_nonce);
    }

    pub fn deserialize(r: &mut Reader) -> WireResult<Self> {
        Ok(Self {
            version: r.read_i32()?,
            prev_hash: r.read_array::<32>()?,
            merkle_root: r.read_array::<32>()?,
            timestamp: r.read_u32()?,
            bits: r.read_u32()?,
            nonce: r.read_u64()?,
            extra_nonce: r.read_array::<16>()?,
        })
    }

    /// Block hash: double SHA-256 of the serialized header.
    pub fn hash(&self) -> Hash {
        double_sha256(&self.serialize())
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash == ZERO_HASH
    }
}

/// Work implied by a compact difficulty target.
///
/// Work per header is ~2^(256 - bitlength(target)). The exact figure needs
/// 256-bit division the chain has no other use for; the power-of-two
/// approximation preserves ordering across difficulty steps, which is all
/// the sync gating consumes.
pub fn work_from_bits(bits: u32) -> Work {
    let exponent = (bits >> 24) as i32;
    let mantissa = (bits & 0x007f_ffff) as u128;
    if mantissa == 0 {
        return 0;
    }
    let mantissa_bits = 128 - mantissa.leading_zeros() as i32;
    let target_bits = mantissa_bits + 8 * (exponent - 3);
    let work_exp = 256 - target_bits;
    if work_exp >= 128 {
        Work::MAX
    } else if work_exp < 1 {
        1
    } else {
        1u128 << work_exp
    }
}

// =============================================================================
// BLOCK INDEX
// =============================================================================

/// One node of the header tree.
#[derive(Debug, Clone)]
pub struct BlockIndex {
    pub header: BlockHeader,
    pub hash: Hash,
    pub height: i32,
    pub chain_work: Work,
}

/// Compact ancestor list identifying what the requester already has:
/// dense for the last ten blocks, exponentially sparser further back,
/// genesis always last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockLocator {
    pub hashes: Vec<Hash>,
}

/// Why a headers batch was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// First header's parent is unknown to the tree.
    Unconnected,
    /// The validity hook refused a header (e.g. bad proof of work).
    Invalid,
}

type ValidityHook = Box<dyn Fn(&BlockHeader) -> bool + Send>;
type ConnectedHook = Box<dyn Fn(&BlockHeader, i32) + Send>;

// =============================================================================
// CHAINSTATE
// =============================================================================

pub struct ChainState {
    index: HashMap<Hash, BlockIndex>,
    /// Active chain, height -> hash. Always starts at genesis.
    active: Vec<Hash>,
    /// Work a competing headers batch must carry before we integrate it.
    minimum_chain_work: Work,
    max_tip_age_secs: i64,
    validity_hook: Option<ValidityHook>,
    connected_hooks: Vec<ConnectedHook>,
}

impl ChainState {
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = genesis.hash();
        let work = work_from_bits(genesis.bits);
        let mut index = HashMap::new();
        index.insert(
            hash,
            BlockIndex { header: genesis, hash, height: 0, chain_work: work },
        );
        Self {
            index,
            active: vec![hash],
            minimum_chain_work: 0,
            max_tip_age_secs: DEFAULT_MAX_TIP_AGE_SECS,
            validity_hook: None,
            connected_hooks: Vec::new(),
        }
    }

    /// Regtest-style genesis used by the binary and the test harness.
    pub fn regtest_genesis() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: ZERO_HASH,
            merkle_root: [0x4f; 32],
            timestamp: 1_700_000_000,
            bits: 0x207f_ffff,
            nonce: 0,
            extra_nonce: [0u8; 16],
        }
    }

    /// Install a header-validity predicate (tests use this to model
    /// invalid-PoW rejection).
    pub fn set_validity_hook(&mut self, hook: impl Fn(&BlockHeader) -> bool + Send + 'static) {
        self.validity_hook = Some(Box::new(hook));
    }

    /// Subscribe to blocks joining the active chain. Callbacks run inline
    /// during `process_new_block_headers` and must be cheap and
    /// non-reentrant; the network layer just posts an event to its reactor.
    pub fn on_block_connected(&mut self, hook: impl Fn(&BlockHeader, i32) + Send + 'static) {
        self.connected_hooks.push(Box::new(hook));
    }

    pub fn set_minimum_chain_work(&mut self, work: Work) {
        self.minimum_chain_work = work;
    }

    pub fn set_max_tip_age(&mut self, secs: i64) {
        self.max_tip_age_secs = secs;
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn tip(&self) -> &BlockIndex {
        let hash = self.active.last().expect("active chain never empty");
        &self.index[hash]
    }

    pub fn height(&self) -> i32 {
        self.active.len() as i32 - 1
    }

    pub fn genesis_hash(&self) -> Hash {
        self.active[0]
    }

    pub fn lookup(&self, hash: &Hash) -> Option<&BlockIndex> {
        self.index.get(hash)
    }

    pub fn have_header(&self, hash: &Hash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn is_on_active_chain(&self, hash: &Hash) -> bool {
        match self.index.get(hash) {
            Some(entry) => self.active.get(entry.height as usize) == Some(hash),
            None => false,
        }
    }

    pub fn active_hash_at(&self, height: i32) -> Option<Hash> {
        if height < 0 {
            return None;
        }
        self.active.get(height as usize).copied()
    }

    /// In initial block download while the tip is stale. Height zero is
    /// always IBD.
    pub fn is_initial_block_download(&self) -> bool {
        let tip = self.tip();
        if tip.height == 0 {
            return true;
        }
        (tip.header.timestamp as i64) < now() - self.max_tip_age_secs
    }

    pub fn anti_dos_work_threshold(&self) -> Work {
        self.minimum_chain_work
    }

    pub fn calculate_headers_work(&self, headers: &[BlockHeader]) -> Work {
        headers
            .iter()
            .map(|h| work_from_bits(h.bits))
            .fold(0u128, |acc, w| acc.saturating_add(w))
    }

    // -------------------------------------------------------------------------
    // Locators
    // -------------------------------------------------------------------------

    /// Locator starting from the tip's parent when one exists. Starting one
    /// block back guarantees the responder finds at least one header to
    /// send even when both tips coincide.
    pub fn locator_from_prev(&self) -> BlockLocator {
        let tip = self.tip();
        let start = if tip.height > 0 {
            self.active[(tip.height - 1) as usize]
        } else {
            tip.hash
        };
        self.locator_from(&start)
    }

    /// Walk back from `start`: step 1 for the first ten entries, doubling
    /// afterwards, genesis always included last. Capped at MAX_LOCATOR_SZ.
    pub fn locator_from(&self, start: &Hash) -> BlockLocator {
        let mut hashes = Vec::new();
        let Some(entry) = self.index.get(start) else {
            return BlockLocator { hashes: vec![self.genesis_hash()] };
        };

        let mut height = entry.height;
        let mut current = *start;
        let mut step: i32 = 1;
        loop {
            hashes.push(current);
            if height == 0 || hashes.len() >= crate::net::types::MAX_LOCATOR_SZ {
                break;
            }
            if hashes.len() >= 10 {
                step = step.saturating_mul(2);
            }
            height = (height - step).max(0);
            // Walk the ancestor on whichever branch `current` sits on
            current = self.ancestor_of(&current, height);
        }
        if *hashes.last().unwrap() != self.genesis_hash() {
            if hashes.len() == crate::net::types::MAX_LOCATOR_SZ {
                hashes.pop();
            }
            hashes.push(self.genesis_hash());
        }
        BlockLocator { hashes }
    }

    fn ancestor_of(&self, hash: &Hash, height: i32) -> Hash {
        let mut current = *hash;
        loop {
            let entry = &self.index[&current];
            if entry.height <= height {
                return current;
            }
            current = entry.header.prev_hash;
        }
    }

    /// First locator entry that is on our active chain, or None when the
    /// requester shares no block with us (not even a genesis claim).
    pub fn find_fork(&self, locator: &BlockLocator) -> Option<i32> {
        for hash in &locator.hashes {
            if self.is_on_active_chain(hash) {
                return Some(self.index[hash].height);
            }
        }
        None
    }

    /// Active-chain headers after `from_height`, up to `max`, stopping after
    /// `stop_hash` when it is non-zero.
    pub fn headers_after(&self, from_height: i32, stop_hash: &Hash, max: usize) -> Vec<BlockHeader> {
        let mut out = Vec::new();
        let mut height = from_height + 1;
        while out.len() < max {
            let Some(hash) = self.active_hash_at(height) else {
                break;
            };
            out.push(self.index[&hash].header);
            if *stop_hash != ZERO_HASH && hash == *stop_hash {
                break;
            }
            height += 1;
        }
        out
    }

    // -------------------------------------------------------------------------
    // Header acceptance
    // -------------------------------------------------------------------------

    /// Connect a batch of headers into the tree and re-evaluate the active
    /// chain. Returns the number of previously unknown headers accepted.
    ///
    /// Known headers are skipped without error. The first unknown header
    /// whose parent is missing fails the whole batch: the network layer's
    /// continuity pre-check makes this the misbehaving-peer path, not a
    /// normal one.
    pub fn process_new_block_headers(
        &mut self,
        headers: &[BlockHeader],
    ) -> Result<usize, RejectReason> {
        let mut accepted = 0usize;
        let mut connected: Vec<(BlockHeader, i32, Hash)> = Vec::new();

        for header in headers {
            let hash = header.hash();
            if self.index.contains_key(&hash) {
                continue;
            }
            let Some(prev) = self.index.get(&header.prev_hash) else {
                return Err(RejectReason::Unconnected);
            };
            if let Some(hook) = &self.validity_hook {
                if !hook(header) {
                    return Err(RejectReason::Invalid);
                }
            }
            let height = prev.height + 1;
            let chain_work = prev.chain_work.saturating_add(work_from_bits(header.bits));
            self.index.insert(
                hash,
                BlockIndex { header: *header, hash, height, chain_work },
            );
            accepted += 1;
            connected.push((*header, height, hash));
        }

        if accepted > 0 {
            self.update_active_chain();
            // Notify only for headers that landed on the active chain
            for (header, height, hash) in connected {
                if self.is_on_active_chain(&hash) {
                    for hook in &self.connected_hooks {
                        hook(&header, height);
                    }
                }
            }
        }
        Ok(accepted)
    }

    /// Point the active chain at the most-work leaf. Returns true when the
    /// tip changed.
    fn update_active_chain(&mut self) -> bool {
        let best = self
            .index
            .values()
            .max_by(|a, b| {
                a.chain_work
                    .cmp(&b.chain_work)
                    .then(b.height.cmp(&a.height))
            })
            .expect("index never empty");

        if best.hash == self.tip().hash {
            return false;
        }

        let mut chain = Vec::with_capacity(best.height as usize + 1);
        let mut current = best.hash;
        loop {
            chain.push(current);
            let entry = &self.index[&current];
            if entry.height == 0 {
                break;
            }
            current = entry.header.prev_hash;
        }
        chain.reverse();
        self.active = chain;
        true
    }

    // -------------------------------------------------------------------------
    // Test / regtest helpers
    // -------------------------------------------------------------------------

    /// Deterministic child header on top of `prev`. Used by the regtest
    /// miner and the test harness; `salt` differentiates competing branches.
    pub fn make_child_header(prev: &BlockIndex, timestamp: u32, salt: u64) -> BlockHeader {
        let mut extra = [0u8; 16];
        extra[..8].copy_from_slice(&salt.to_le_bytes());
        BlockHeader {
            version: 1,
            prev_hash: prev.hash,
            merkle_root: [0u8; 32],
            timestamp,
            bits: prev.header.bits,
            nonce: prev.height as u64 + 1,
            extra_nonce: extra,
        }
    }

    /// Extend the active chain by `count` headers stamped `timestamp`.
    /// Returns the new tip hashes oldest-first.
    pub fn mine(&mut self, count: usize, timestamp: u32, salt: u64) -> Vec<Hash> {
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            let header = Self::make_child_header(self.tip(), timestamp, salt);
            self.process_new_block_headers(std::slice::from_ref(&header))
                .expect("locally built header always connects");
            hashes.push(header.hash());
        }
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::types::MAX_LOCATOR_SZ;

    fn chain_with(height: usize) -> ChainState {
        let mut chain = ChainState::new(ChainState::regtest_genesis());
        chain.mine(height, now() as u32, 0);
        chain
    }

    #[test]
    fn test_header_roundtrip_is_100_bytes() {
        let header = ChainState::regtest_genesis();
        let bytes = header.serialize();
        assert_eq!(bytes.len(), BLOCK_HEADER_SIZE);

        let mut r = Reader::new(&bytes);
        let decoded = BlockHeader::deserialize(&mut r).unwrap();
        r.expect_end().unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.hash(), header.hash());
    }

    #[test]
    fn test_work_ordering() {
        // Smaller target (higher difficulty) must imply more work
        let easy = work_from_bits(0x207f_ffff);
        let harder = work_from_bits(0x1f7f_ffff);
        assert!(harder > easy);
        assert!(easy >= 1);
    }

    #[test]
    fn test_mine_extends_active_chain() {
        let mut chain = ChainState::new(ChainState::regtest_genesis());
        assert_eq!(chain.height(), 0);
        let hashes = chain.mine(5, now() as u32, 0);
        assert_eq!(chain.height(), 5);
        assert_eq!(chain.tip().hash, *hashes.last().unwrap());
        assert!(chain.is_on_active_chain(&hashes[0]));
    }

    #[test]
    fn test_unconnected_batch_rejected() {
        let mut chain = chain_with(2);
        let orphan = BlockHeader {
            prev_hash: [0xee; 32],
            ..ChainState::regtest_genesis()
        };
        assert_eq!(
            chain.process_new_block_headers(&[orphan]),
            Err(RejectReason::Unconnected)
        );
        assert_eq!(chain.height(), 2);
    }

    #[test]
    fn test_validity_hook_rejects() {
        let mut chain = chain_with(1);
        chain.set_validity_hook(|h| h.nonce != 99);
        let mut bad = ChainState::make_child_header(chain.tip(), now() as u32, 0);
        bad.nonce = 99;
        assert_eq!(
            chain.process_new_block_headers(&[bad]),
            Err(RejectReason::Invalid)
        );
    }

    #[test]
    fn test_duplicate_headers_skipped() {
        let mut chain = chain_with(3);
        let tip_header = chain.tip().header;
        let accepted = chain.process_new_block_headers(&[tip_header]).unwrap();
        assert_eq!(accepted, 0);
    }

    #[test]
    fn test_reorg_to_more_work() {
        let mut a = ChainState::new(ChainState::regtest_genesis());
        let mut b = ChainState::new(ChainState::regtest_genesis());
        a.mine(3, now() as u32, 1);
        b.mine(5, now() as u32, 2);

        // Feed B's longer branch into A
        let headers = b.headers_after(0, &ZERO_HASH, 100);
        a.process_new_block_headers(&headers).unwrap();
        assert_eq!(a.height(), 5);
        assert_eq!(a.tip().hash, b.tip().hash);
    }

    #[test]
    fn test_locator_shape() {
        let chain = chain_with(200);
        let locator = chain.locator_from_prev();
        assert!(locator.hashes.len() <= MAX_LOCATOR_SZ);
        // Starts from pprev of tip
        assert_eq!(locator.hashes[0], chain.active_hash_at(198).unwrap());
        // Dense for first ten entries
        assert_eq!(locator.hashes[9], chain.active_hash_at(189).unwrap());
        // Genesis last
        assert_eq!(*locator.hashes.last().unwrap(), chain.genesis_hash());
    }

    #[test]
    fn test_locator_genesis_fallback() {
        let chain = ChainState::new(ChainState::regtest_genesis());
        let locator = chain.locator_from_prev();
        assert_eq!(locator.hashes, vec![chain.genesis_hash()]);
    }

    #[test]
    fn test_find_fork_and_headers_after() {
        let a = chain_with(10);
        let b = chain_with(0);
        let locator = b.locator_from_prev();
        let fork = a.find_fork(&locator).unwrap();
        assert_eq!(fork, 0);
        let headers = a.headers_after(fork, &ZERO_HASH, 4);
        assert_eq!(headers.len(), 4);
        assert_eq!(headers[0].prev_hash, a.genesis_hash());

        // Unknown locator => no fork
        let alien = BlockLocator { hashes: vec![[0xaa; 32]] };
        assert!(a.find_fork(&alien).is_none());

        // Stop hash honored
        let stop = a.active_hash_at(2).unwrap();
        let headers = a.headers_after(0, &stop, 100);
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_ibd_predicate() {
        let mut fresh = ChainState::new(ChainState::regtest_genesis());
        assert!(fresh.is_initial_block_download());
        fresh.mine(1, now() as u32, 0);
        assert!(!fresh.is_initial_block_download());

        let mut stale = ChainState::new(ChainState::regtest_genesis());
        stale.mine(1, 1_700_000_100, 0);
        assert!(stale.is_initial_block_download());
    }

    #[test]
    fn test_connected_hook_fires() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        let mut chain = ChainState::new(ChainState::regtest_genesis());
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        chain.on_block_connected(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        chain.mine(3, now() as u32, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
