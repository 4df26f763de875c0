//! P2P message catalog and payload codec
//!
//! One tagged enum covers the whole command catalog; `command()` is a pure
//! function of the arm. Deserialization is driven by the command string from
//! the already-validated frame header, enforces every container cap before
//! allocating, and requires the payload to be consumed exactly. For any
//! decoded message, re-serializing yields byte-identical output.

use crate::chain::BlockHeader;
use crate::types::Hash;

use super::types::{
    InventoryItem, MAX_ADDR_SIZE, MAX_HEADERS_SIZE, MAX_INV_SIZE, MAX_LOCATOR_SZ,
    MAX_SUBVERSION_LENGTH, NetworkAddress, TimestampedAddress,
};
use super::wire::{Reader, WireError, WireResult, Writer};

// =============================================================================
// COMMANDS
// =============================================================================

pub mod commands {
    pub const VERSION: &str = "version";
    pub const VERACK: &str = "verack";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const GETADDR: &str = "getaddr";
    pub const ADDR: &str = "addr";
    pub const INV: &str = "inv";
    pub const GETHEADERS: &str = "getheaders";
    pub const HEADERS: &str = "headers";
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Version handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    /// How we see the peer's address.
    pub addr_recv: NetworkAddress,
    /// Our own address (may be unroutable if unknown).
    pub addr_from: NetworkAddress,
    /// Random nonce for self-connection detection.
    pub nonce: u64,
    /// Client identifier, capped at MAX_SUBVERSION_LENGTH.
    pub user_agent: String,
    pub start_height: i32,
}

/// Getheaders request: locator plus stop hash (all-zero = as many as fit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersPayload {
    pub version: u32,
    pub locator_hashes: Vec<Hash>,
    pub stop_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionPayload),
    Verack,
    Ping(u64),
    Pong(u64),
    GetAddr,
    Addr(Vec<TimestampedAddress>),
    Inv(Vec<InventoryItem>),
    GetHeaders(GetHeadersPayload),
    Headers(Vec<BlockHeader>),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => commands::VERSION,
            Message::Verack => commands::VERACK,
            Message::Ping(_) => commands::PING,
            Message::Pong(_) => commands::PONG,
            Message::GetAddr => commands::GETADDR,
            Message::Addr(_) => commands::ADDR,
            Message::Inv(_) => commands::INV,
            Message::GetHeaders(_) => commands::GETHEADERS,
            Message::Headers(_) => commands::HEADERS,
        }
    }

    /// Messages a peer may send before the handshake completes.
    pub fn allowed_pre_handshake(&self) -> bool {
        matches!(self, Message::Version(_) | Message::Verack)
    }

    // -------------------------------------------------------------------------
    // Serialization
    // -------------------------------------------------------------------------

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Message::Version(v) => {
                w.write_i32(v.version);
                w.write_u64(v.services);
                w.write_i64(v.timestamp);
                write_network_address(&mut w, &v.addr_recv);
                write_network_address(&mut w, &v.addr_from);
                w.write_u64(v.nonce);
                w.write_string(&v.user_agent);
                w.write_i32(v.start_height);
            }
            Message::Verack | Message::GetAddr => {}
            Message::Ping(nonce) | Message::Pong(nonce) => {
                w.write_u64(*nonce);
            }
            Message::Addr(addrs) => {
                w.write_varint(addrs.len() as u64);
                for addr in addrs {
                    w.write_u32(addr.timestamp);
                    write_network_address(&mut w, &addr.address);
                }
            }
            Message::Inv(items) => {
                w.write_varint(items.len() as u64);
                for item in items {
                    w.write_u32(item.inv_type);
                    w.write_bytes(&item.hash);
                }
            }
            Message::GetHeaders(payload) => {
                w.write_u32(payload.version);
                w.write_varint(payload.locator_hashes.len() as u64);
                for hash in &payload.locator_hashes {
                    w.write_bytes(hash);
                }
                w.write_bytes(&payload.stop_hash);
            }
            Message::Headers(headers) => {
                w.write_varint(headers.len() as u64);
                for header in headers {
                    header.serialize_into(&mut w);
                }
            }
        }
        w.into_bytes()
    }

    // -------------------------------------------------------------------------
    // Deserialization
    // -------------------------------------------------------------------------

    /// Decode a payload for `command`. Unknown commands yield None — the
    /// dispatcher treats them as no-ops rather than disconnect fodder.
    pub fn deserialize(command: &str, payload: &[u8]) -> WireResult<Option<Message>> {
        let mut r = Reader::new(payload);
        let msg = match command {
            commands::VERSION => {
                let version = r.read_i32()?;
                let services = r.read_u64()?;
                let timestamp = r.read_i64()?;
                let addr_recv = read_network_address(&mut r)?;
                let addr_from = read_network_address(&mut r)?;
                let nonce = r.read_u64()?;
                let user_agent = r.read_string(MAX_SUBVERSION_LENGTH)?;
                let start_height = r.read_i32()?;
                Message::Version(VersionPayload {
                    version,
                    services,
                    timestamp,
                    addr_recv,
                    addr_from,
                    nonce,
                    user_agent,
                    start_height,
                })
            }
            // Empty-payload commands: a non-empty payload is a protocol
            // violation surfaced by expect_end below
            commands::VERACK => Message::Verack,
            commands::GETADDR => Message::GetAddr,
            commands::PING => Message::Ping(r.read_u64()?),
            commands::PONG => Message::Pong(r.read_u64()?),
            commands::ADDR => {
                let count = r.read_count()? as usize;
                if count > MAX_ADDR_SIZE {
                    return Err(WireError::OversizedCollection);
                }
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    let timestamp = r.read_u32()?;
                    let address = read_network_address(&mut r)?;
                    addrs.push(TimestampedAddress { timestamp, address });
                }
                Message::Addr(addrs)
            }
            commands::INV => {
                let count = r.read_count()? as usize;
                if count > MAX_INV_SIZE {
                    return Err(WireError::OversizedCollection);
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    let inv_type = r.read_u32()?;
                    let hash = r.read_array::<32>()?;
                    items.push(InventoryItem { inv_type, hash });
                }
                Message::Inv(items)
            }
            commands::GETHEADERS => {
                let version = r.read_u32()?;
                let count = r.read_count()? as usize;
                if count > MAX_LOCATOR_SZ {
                    return Err(WireError::OversizedCollection);
                }
                let mut locator_hashes = Vec::with_capacity(count);
                for _ in 0..count {
                    locator_hashes.push(r.read_array::<32>()?);
                }
                let stop_hash = r.read_array::<32>()?;
                Message::GetHeaders(GetHeadersPayload { version, locator_hashes, stop_hash })
            }
            commands::HEADERS => {
                let count = r.read_count()? as usize;
                if count > MAX_HEADERS_SIZE {
                    return Err(WireError::OversizedCollection);
                }
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(BlockHeader::deserialize(&mut r)?);
                }
                Message::Headers(headers)
            }
            _ => return Ok(None),
        };
        r.expect_end()?;
        Ok(Some(msg))
    }
}

// =============================================================================
// STRUCTURE CODECS
// =============================================================================

fn write_network_address(w: &mut Writer, addr: &NetworkAddress) {
    w.write_u64(addr.services);
    w.write_bytes(&addr.ip);
    w.write_u16_be(addr.port);
}

fn read_network_address(r: &mut Reader) -> WireResult<NetworkAddress> {
    let services = r.read_u64()?;
    let ip = r.read_array::<16>()?;
    let port = r.read_u16_be()?;
    Ok(NetworkAddress { services, ip, port })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainState;
    use crate::net::types::NODE_NETWORK;
    use crate::net::wire::write_varint;
    use crate::types::ZERO_HASH;

    fn sample_address(last_octet: u8) -> NetworkAddress {
        NetworkAddress::new(
            format!("93.184.216.{last_octet}").parse().unwrap(),
            18388,
            NODE_NETWORK,
        )
    }

    fn sample_version() -> Message {
        Message::Version(VersionPayload {
            version: 1,
            services: NODE_NETWORK,
            timestamp: 1_700_000_123,
            addr_recv: sample_address(34),
            addr_from: sample_address(35),
            nonce: 0xdead_beef_cafe_f00d,
            user_agent: "/obelisk:0.4.0/".to_string(),
            start_height: 42,
        })
    }

    fn roundtrip(msg: &Message) {
        let bytes = msg.serialize();
        let decoded = Message::deserialize(msg.command(), &bytes).unwrap().unwrap();
        assert_eq!(&decoded, msg);
        // Determinism: serialize(deserialize(x)) == x
        assert_eq!(decoded.serialize(), bytes);
    }

    #[test]
    fn test_roundtrip_all_messages() {
        roundtrip(&sample_version());
        roundtrip(&Message::Verack);
        roundtrip(&Message::Ping(7));
        roundtrip(&Message::Pong(7));
        roundtrip(&Message::GetAddr);
        roundtrip(&Message::Addr(vec![
            TimestampedAddress { timestamp: 100, address: sample_address(1) },
            TimestampedAddress { timestamp: 200, address: sample_address(2) },
        ]));
        roundtrip(&Message::Inv(vec![InventoryItem::block([0xab; 32])]));
        roundtrip(&Message::GetHeaders(GetHeadersPayload {
            version: 1,
            locator_hashes: vec![[1; 32], [2; 32]],
            stop_hash: ZERO_HASH,
        }));
        roundtrip(&Message::Headers(vec![ChainState::regtest_genesis()]));
    }

    #[test]
    fn test_empty_payload_commands_reject_payload() {
        assert_eq!(
            Message::deserialize(commands::VERACK, &[0u8]),
            Err(WireError::TrailingBytes)
        );
        assert_eq!(
            Message::deserialize(commands::GETADDR, &[0u8]),
            Err(WireError::TrailingBytes)
        );
    }

    #[test]
    fn test_unknown_command_is_none() {
        assert_eq!(Message::deserialize("sendcmpct", &[]), Ok(None));
    }

    #[test]
    fn test_truncated_version_rejected() {
        let bytes = sample_version().serialize();
        assert!(Message::deserialize(commands::VERSION, &bytes[..20]).is_err());
    }

    #[test]
    fn test_oversized_user_agent_rejected() {
        let Message::Version(mut payload) = sample_version() else { unreachable!() };
        payload.user_agent = "x".repeat(MAX_SUBVERSION_LENGTH + 1);
        let bytes = Message::Version(payload).serialize();
        assert_eq!(
            Message::deserialize(commands::VERSION, &bytes),
            Err(WireError::StringTooLong)
        );
    }

    #[test]
    fn test_addr_count_cap() {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, (MAX_ADDR_SIZE + 1) as u64);
        assert_eq!(
            Message::deserialize(commands::ADDR, &bytes),
            Err(WireError::OversizedCollection)
        );
    }

    #[test]
    fn test_inv_count_cap() {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, (MAX_INV_SIZE + 1) as u64);
        assert_eq!(
            Message::deserialize(commands::INV, &bytes),
            Err(WireError::OversizedCollection)
        );
    }

    #[test]
    fn test_headers_count_cap() {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, (MAX_HEADERS_SIZE + 1) as u64);
        assert_eq!(
            Message::deserialize(commands::HEADERS, &bytes),
            Err(WireError::OversizedCollection)
        );
    }

    #[test]
    fn test_headers_compactsize_bomb() {
        // Claimed count of 2^64-1: must fail on the count itself, before
        // any element allocation
        let bytes = [0xffu8; 9];
        assert_eq!(
            Message::deserialize(commands::HEADERS, &bytes),
            Err(WireError::SizeTooLarge)
        );
    }

    #[test]
    fn test_locator_cap() {
        let payload = GetHeadersPayload {
            version: 1,
            locator_hashes: vec![[0u8; 32]; MAX_LOCATOR_SZ + 1],
            stop_hash: ZERO_HASH,
        };
        let bytes = Message::GetHeaders(payload).serialize();
        assert_eq!(
            Message::deserialize(commands::GETHEADERS, &bytes),
            Err(WireError::OversizedCollection)
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Message::Ping(1).serialize();
        bytes.push(0);
        assert_eq!(
            Message::deserialize(commands::PING, &bytes),
            Err(WireError::TrailingBytes)
        );
    }
}
