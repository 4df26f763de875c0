// Obelisk Network Layer — Constants and Types
// Distributed under the MIT software license.

//! Network constants and small protocol types for the Obelisk P2P protocol.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** — every length field on the wire has an explicit
//!    cap checked before allocation. An attacker cannot exhaust memory by
//!    claiming large collection counts.
//!
//! 2. **DoS resistance** — misbehavior scoring, bans, discouragement, and
//!    per-IP connection limits bound what any single address can cost us.
//!
//! 3. **Single-writer state** — everything here is plain data; all mutation
//!    happens on the network reactor task (see `manager.rs`).

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::types::Hash;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Protocol version number. Increment on breaking wire format changes.
pub const PROTOCOL_VERSION: i32 = 1;

/// Magic bytes for mainnet. Prevents cross-talk with other P2P networks.
pub const MAINNET_MAGIC: [u8; 4] = *b"OBLK";

/// Magic bytes for testnet.
pub const TESTNET_MAGIC: [u8; 4] = *b"OBLT";

/// Magic bytes for regtest.
pub const REGTEST_MAGIC: [u8; 4] = *b"OBLR";

/// Default TCP port for mainnet.
pub const DEFAULT_PORT: u16 = 18388;

/// Service bit advertised by every full node. The only service bit in use.
pub const NODE_NETWORK: u64 = 1 << 0;

// =============================================================================
// WIRE LIMITS
// =============================================================================
// Each limit is checked before any allocation sized by attacker input.

/// Wire message header: magic(4) + command(12) + length(4) + checksum(4).
pub const MESSAGE_HEADER_SIZE: usize = 24;

/// Maximum payload length accepted in a frame (4 MiB).
pub const MAX_PROTOCOL_MESSAGE_LENGTH: u32 = 4 * 1024 * 1024;

/// Maximum value a CompactSize may carry in any container-length context.
pub const MAX_SIZE: u64 = 0x0200_0000;

/// Maximum user agent string length in a version message.
pub const MAX_SUBVERSION_LENGTH: usize = 256;

/// Maximum addresses in a single addr message.
pub const MAX_ADDR_SIZE: usize = 1_000;

/// Maximum items in a single inv message.
pub const MAX_INV_SIZE: usize = 50_000;

/// Maximum headers in a single headers message.
pub const MAX_HEADERS_SIZE: usize = 2_000;

/// Maximum hashes in a block locator.
pub const MAX_LOCATOR_SZ: usize = 101;

// =============================================================================
// CONNECTION LIMITS AND TIMEOUTS
// =============================================================================

/// Max connections accepted from the same IP address.
/// 2 allows NAT users while preventing single-IP slot flooding.
pub const PER_IP_LIMIT: usize = 2;

/// Default target of full outbound connections.
pub const DEFAULT_OUTBOUND_TARGET: usize = 8;

/// Handshake must reach READY within this window.
/// 60s allows high-latency links while stopping slowloris holds.
pub const HANDSHAKE_TIMEOUT_SECS: i64 = 60;

/// A peer that sends nothing for this long is dropped.
pub const IDLE_TIMEOUT_SECS: i64 = 20 * 60;

/// A peer that does not answer our ping for this long is dropped.
pub const PING_TIMEOUT_SECS: i64 = 20 * 60;

/// Interval between keep-alive pings.
pub const PING_INTERVAL_SECS: i64 = 120;

/// TCP connect attempts are abandoned after this long.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Send queue cap per connection. Overflow closes the connection —
/// backpressure is not negotiated with a peer that will not read.
pub const DEFAULT_SEND_QUEUE_SIZE: usize = 5 * 1024 * 1024;

/// Unprocessed receive bytes cap per connection. A peer that outruns our
/// frame processing by this much is flooding and gets closed.
pub const DEFAULT_RECV_FLOOD_SIZE: usize = 5 * 1024 * 1024;

// =============================================================================
// MISBEHAVIOR
// =============================================================================

/// Score at which a peer is discouraged and disconnected (unless NoBan).
pub const DISCOURAGE_THRESHOLD: u32 = 100;

/// Consecutive HEADERS batches whose first header does not connect before
/// the peer is dropped.
pub const MAX_UNCONNECTING_HEADERS: u32 = 10;

/// During IBD, unsolicited HEADERS batches above this count are accepted
/// only from the designated sync peer.
pub const MAX_UNSOLICITED_HEADERS: usize = 2;

/// Default duration of a discouragement entry.
pub const DISCOURAGEMENT_DURATION_SECS: i64 = 24 * 60 * 60;

/// Default manual ban duration.
pub const DEFAULT_BAN_DURATION_SECS: i64 = 24 * 60 * 60;

// =============================================================================
// SYNC AND RELAY CADENCE
// =============================================================================

/// Sync peer is dropped if no HEADERS arrive for this long.
pub const HEADER_SYNC_STALL_TIMEOUT_SECS: i64 = 120;

/// Minimum interval between re-announcements of the same tip to one peer.
pub const REANNOUNCE_INTERVAL_SECS: i64 = 10 * 60;

/// Send-messages cadence: initial-sync checks and INV queue flushes.
pub const SENDMESSAGES_INTERVAL_SECS: u64 = 1;

/// Maintenance cadence: sweeps, timeout checks, tip re-announcement.
pub const MAINTENANCE_INTERVAL_SECS: u64 = 30;

/// Connect-attempt cadence: outbound slot top-up.
pub const CONNECT_INTERVAL_SECS: u64 = 5;

/// Mean interval between feeler connections (Poisson-scheduled).
pub const FEELER_INTERVAL_SECS: u64 = 120;

/// Addresses a peer announced within this window are excluded from our
/// addr replies to that peer (echo suppression).
pub const ADDR_ECHO_SUPPRESSION_SECS: i64 = 10 * 60;

/// Maximum anchors persisted at shutdown.
pub const MAX_ANCHORS: usize = 2;

// =============================================================================
// PEER IDENTITY AND PERMISSIONS
// =============================================================================

/// Monotonic peer identifier, assigned on accept/connect, never reused.
pub type PeerId = u64;

/// Per-peer permission flags.
///
/// `NOBAN` exempts a peer from disconnect-due-to-score; the score itself is
/// still tracked. Whitelisting affects admission only — a whitelisted address
/// can still be banned by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetPermissionFlags(u32);

impl NetPermissionFlags {
    pub const NONE: NetPermissionFlags = NetPermissionFlags(0);
    pub const NOBAN: NetPermissionFlags = NetPermissionFlags(1 << 0);

    pub fn contains(&self, other: NetPermissionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: NetPermissionFlags) -> NetPermissionFlags {
        NetPermissionFlags(self.0 | other.0)
    }
}

/// Different kinds of connections to a peer. Aside from `Inbound`, all are
/// initiated by us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Initiated by the peer. The only property known at accept time.
    Inbound,
    /// Default connections opened from the address table, up to the
    /// outbound target. Relay headers and addresses.
    Outbound,
    /// Explicitly requested by the operator. Never auto-discouraged.
    Manual,
    /// Short-lived liveness probe: disconnected right after VERACK, used to
    /// move addresses from the new table into tried.
    Feeler,
}

impl ConnectionType {
    pub fn is_outbound(&self) -> bool {
        !matches!(self, ConnectionType::Inbound)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Inbound => "inbound",
            ConnectionType::Outbound => "outbound",
            ConnectionType::Manual => "manual",
            ConnectionType::Feeler => "feeler",
        }
    }
}

// =============================================================================
// NETWORK ADDRESS
// =============================================================================

/// Network address as carried in version/addr messages and anchors.json.
///
/// On the wire the IP is always the 16-byte IPv6 form; IPv4 addresses use
/// the v4-mapped representation (::ffff:a.b.c.d).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(ip: IpAddr, port: u16, services: u64) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self { services, ip, port }
    }

    pub fn from_socket_addr(addr: SocketAddr, services: u64) -> Self {
        Self::new(addr.ip(), addr.port(), services)
    }

    /// Canonical IpAddr: v4-mapped addresses come back as V4.
    pub fn ip_addr(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_addr(), self.port)
    }

    /// Globally routable check. Filters loopback, private, link-local,
    /// unspecified and multicast addresses so the address table is not
    /// polluted with unconnectable entries.
    pub fn is_routable(&self) -> bool {
        match self.ip_addr() {
            IpAddr::V4(ip) => {
                !ip.is_private()
                    && !ip.is_loopback()
                    && !ip.is_link_local()
                    && !ip.is_broadcast()
                    && !ip.is_documentation()
                    && !ip.is_unspecified()
            }
            IpAddr::V6(ip) => {
                if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
                    return false;
                }
                let segments = ip.segments();
                // fc00::/7 unique local
                if (segments[0] & 0xfe00) == 0xfc00 {
                    return false;
                }
                // fe80::/10 link-local
                if (segments[0] & 0xffc0) == 0xfe80 {
                    return false;
                }
                true
            }
        }
    }
}

/// Address with the sender's freshness claim, as carried in addr messages.
/// The timestamp is self-reported and untrusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedAddress {
    pub timestamp: u32,
    pub address: NetworkAddress,
}

// =============================================================================
// INVENTORY
// =============================================================================

/// Inventory type tag. Only blocks exist on a headers-only chain.
pub const MSG_BLOCK: u32 = 2;

/// Inventory item: identifies an object by type and hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InventoryItem {
    pub inv_type: u32,
    pub hash: Hash,
}

impl InventoryItem {
    pub fn block(hash: Hash) -> Self {
        Self { inv_type: MSG_BLOCK, hash }
    }
}

// =============================================================================
// PEER STATE MACHINE
// =============================================================================

/// Peer handshake state machine.
///
/// ```text
/// NEW --send version--> VERSION_SENT --recv version--> VERSION_RECEIVED
///       (outbound)                                          |
///   inbound: recv version first, then send version+verack   |
///                                          send+recv verack v
///                                                        READY
/// any state --handshake timeout / violation--> DISCONNECTED
/// ```
///
/// READY holds exactly when version and verack have been exchanged in both
/// directions; only then may protocol messages flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    VersionSent,
    VersionReceived,
    Ready,
    Disconnected,
}

/// Why a connection was torn down, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    FramingError,
    DecodeError,
    ProtocolViolation,
    Misbehavior,
    NonceCollision,
    Timeout,
    Stalling,
    RecvFlood,
    SendQueueFull,
    FeelerDone,
    Requested,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::FramingError => "framing error",
            DisconnectReason::DecodeError => "decode error",
            DisconnectReason::ProtocolViolation => "protocol violation",
            DisconnectReason::Misbehavior => "misbehavior",
            DisconnectReason::NonceCollision => "nonce collision",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::Stalling => "stalling",
            DisconnectReason::RecvFlood => "receive flood",
            DisconnectReason::SendQueueFull => "send queue full",
            DisconnectReason::FeelerDone => "feeler complete",
            DisconnectReason::Requested => "requested",
            DisconnectReason::Shutdown => "shutdown",
        }
    }
}

/// Loopback helper for test fixtures.
pub fn localhost(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_mapped_roundtrip() {
        let addr = NetworkAddress::new("93.184.216.34".parse().unwrap(), 18388, NODE_NETWORK);
        assert_eq!(addr.ip[..12], [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(addr.ip_addr(), "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(addr.socket_addr().port(), 18388);
    }

    #[test]
    fn test_routable_filters() {
        let private = NetworkAddress::new("192.168.1.5".parse().unwrap(), 1, 0);
        assert!(!private.is_routable());
        let loopback = NetworkAddress::new("127.0.0.1".parse().unwrap(), 1, 0);
        assert!(!loopback.is_routable());
        let public = NetworkAddress::new("93.184.216.34".parse().unwrap(), 1, 0);
        assert!(public.is_routable());
        let ula = NetworkAddress::new("fc00::1".parse().unwrap(), 1, 0);
        assert!(!ula.is_routable());
    }

    #[test]
    fn test_permission_flags() {
        let flags = NetPermissionFlags::NONE;
        assert!(!flags.contains(NetPermissionFlags::NOBAN));
        let flags = flags.with(NetPermissionFlags::NOBAN);
        assert!(flags.contains(NetPermissionFlags::NOBAN));
    }

    #[test]
    fn test_connection_type_direction() {
        assert!(!ConnectionType::Inbound.is_outbound());
        assert!(ConnectionType::Outbound.is_outbound());
        assert!(ConnectionType::Feeler.is_outbound());
        assert!(ConnectionType::Manual.is_outbound());
    }
}
