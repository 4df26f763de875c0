//! P2P networking layer

pub mod addrman;
pub mod block_relay;
pub mod discovery;
pub mod dispatcher;
pub mod header_sync;
pub mod manager;
pub mod message;
pub mod nat;
pub mod peer;
pub mod peer_manager;
pub mod transport;
pub mod types;
pub mod wire;

// Re-exports
pub use addrman::{AddrMan, AddressInfo};
pub use block_relay::BlockRelayManager;
pub use discovery::{DiscoveryManager, DiscoveryStats, load_anchors, save_anchors};
pub use dispatcher::MessageDispatcher;
pub use header_sync::HeaderSyncManager;
pub use manager::{Command, NetStats, NetworkManager, PeerStatus};
pub use message::{GetHeadersPayload, Message, VersionPayload, commands};
pub use nat::{NatManager, PortMapper};
pub use peer::{MessageGate, Peer};
pub use peer_manager::{BanEntry, BanList, PeerManager, PeerTrackingData};
pub use transport::{Connection, Transport, TransportEvent};
pub use types::*;
pub use wire::{MessageHeader, Reader, WireError, Writer, checksum, double_sha256};
