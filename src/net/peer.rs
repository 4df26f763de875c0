//! Per-connection peer: handshake state machine, frame cutting, scoring
//!
//! A Peer wraps one transport connection. It cuts checksum-verified frames
//! out of the receive stream, enforces the handshake ordering rules, tracks
//! keep-alive timers, and accumulates the misbehavior score. Everything a
//! handler sees from a peer came out of a full frame whose checksum matched.

use std::net::SocketAddr;

use tracing::{debug, trace, warn};

use crate::types::{now, now_us};

use super::message::{Message, VersionPayload};
use super::transport::Connection;
use super::types::{
    ConnectionType, DEFAULT_RECV_FLOOD_SIZE, DISCOURAGE_THRESHOLD, DisconnectReason,
    HANDSHAKE_TIMEOUT_SECS, IDLE_TIMEOUT_SECS, MAX_SUBVERSION_LENGTH, MESSAGE_HEADER_SIZE,
    NetPermissionFlags, PING_INTERVAL_SECS, PING_TIMEOUT_SECS, PeerId, PeerState,
};
use super::wire::{MessageHeader, checksum, deserialize_header, serialize_header};

/// Verdict on an incoming message given the current handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageGate {
    Allow,
    /// Silently dropped (duplicate version/verack).
    Ignore,
    Reject(DisconnectReason),
}

pub struct Peer {
    pub id: PeerId,
    conn: Connection,
    pub conn_type: ConnectionType,
    pub permissions: NetPermissionFlags,
    magic: [u8; 4],

    // Handshake
    pub state: PeerState,
    version_sent: bool,
    version_received: bool,
    verack_sent: bool,
    verack_received: bool,

    // Learned in VERSION
    pub remote_nonce: u64,
    pub remote_services: u64,
    pub remote_start_height: i32,
    pub user_agent: String,

    // Scoring
    pub misbehavior_score: u32,
    pub unconnecting_headers_count: u32,
    /// Set when chosen as the header sync peer.
    pub sync_started: bool,

    // Timers (unix seconds / microseconds)
    pub connected_at: i64,
    pub last_message_us: i64,
    pub last_ping_sent_us: i64,
    pub last_pong_us: i64,
    ping_nonce: Option<u64>,

    // Receive framing
    recv_buf: Vec<u8>,
}

impl Peer {
    pub fn new(
        id: PeerId,
        conn: Connection,
        conn_type: ConnectionType,
        permissions: NetPermissionFlags,
        magic: [u8; 4],
    ) -> Self {
        Self {
            id,
            conn,
            conn_type,
            permissions,
            magic,
            state: PeerState::New,
            version_sent: false,
            version_received: false,
            verack_sent: false,
            verack_received: false,
            remote_nonce: 0,
            remote_services: 0,
            remote_start_height: 0,
            user_agent: String::new(),
            misbehavior_score: 0,
            unconnecting_headers_count: 0,
            sync_started: false,
            connected_at: now(),
            last_message_us: now_us(),
            last_ping_sent_us: 0,
            last_pong_us: 0,
            ping_nonce: None,
            recv_buf: Vec::new(),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn.id()
    }

    pub fn address(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    pub fn is_inbound(&self) -> bool {
        self.conn_type == ConnectionType::Inbound
    }

    pub fn is_outbound(&self) -> bool {
        self.conn_type.is_outbound()
    }

    pub fn is_ready(&self) -> bool {
        self.state == PeerState::Ready
    }

    pub fn is_connected(&self) -> bool {
        self.state != PeerState::Disconnected && self.conn.is_open()
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// Serialize, frame, checksum, and queue a message. Returns false when
    /// the connection is closed or its send queue overflowed.
    pub fn send_message(&mut self, msg: &Message) -> bool {
        let payload = msg.serialize();
        let header = MessageHeader::new(self.magic, msg.command(), &payload);
        let mut frame = serialize_header(&header);
        frame.extend_from_slice(&payload);

        trace!(peer = self.id, command = msg.command(), bytes = frame.len(), "send");
        let sent = self.conn.send(frame);
        if !sent && self.state != PeerState::Disconnected {
            // The connection closed under us; the interesting local cause
            // is a send-queue overflow (remote closes surface via the
            // transport's Closed event regardless)
            self.disconnect(DisconnectReason::SendQueueFull);
            return false;
        }
        if sent && msg.command() == super::message::commands::VERSION {
            self.version_sent = true;
            if self.state == PeerState::New {
                self.state = PeerState::VersionSent;
            }
        }
        if sent && msg.command() == super::message::commands::VERACK {
            self.verack_sent = true;
            self.update_ready();
        }
        sent
    }

    pub fn send_ping(&mut self) -> bool {
        let nonce: u64 = rand::random();
        self.ping_nonce = Some(nonce);
        self.last_ping_sent_us = now_us();
        self.send_message(&Message::Ping(nonce))
    }

    // -------------------------------------------------------------------------
    // Receiving
    // -------------------------------------------------------------------------

    /// Buffer received bytes and cut out all complete frames.
    ///
    /// Framing and decode failures are fatal to the connection; the caller
    /// disconnects with the returned reason. Unknown commands inside valid
    /// frames are skipped.
    pub fn on_data(&mut self, data: &[u8]) -> Result<Vec<Message>, DisconnectReason> {
        self.recv_buf.extend_from_slice(data);
        if self.recv_buf.len() > DEFAULT_RECV_FLOOD_SIZE {
            warn!(peer = self.id, bytes = self.recv_buf.len(), "receive flood");
            return Err(DisconnectReason::RecvFlood);
        }

        let mut messages = Vec::new();
        let mut consumed = 0usize;
        loop {
            let buf = &self.recv_buf[consumed..];
            if buf.len() < MESSAGE_HEADER_SIZE {
                break;
            }
            let header = deserialize_header(buf, self.magic).map_err(|err| {
                debug!(peer = self.id, %err, "bad frame header");
                DisconnectReason::FramingError
            })?;
            let total = MESSAGE_HEADER_SIZE + header.length as usize;
            if buf.len() < total {
                break;
            }
            let payload = &buf[MESSAGE_HEADER_SIZE..total];
            if checksum(payload) != header.checksum {
                debug!(peer = self.id, command = header.command_str(), "checksum mismatch");
                return Err(DisconnectReason::FramingError);
            }
            match Message::deserialize(header.command_str(), payload) {
                Ok(Some(msg)) => messages.push(msg),
                Ok(None) => {
                    trace!(peer = self.id, command = header.command_str(), "unknown command ignored");
                }
                Err(err) => {
                    debug!(peer = self.id, command = header.command_str(), %err, "decode failed");
                    return Err(DisconnectReason::DecodeError);
                }
            }
            consumed += total;
        }
        if consumed > 0 {
            self.recv_buf.drain(..consumed);
            self.last_message_us = now_us();
        }
        Ok(messages)
    }

    // -------------------------------------------------------------------------
    // Handshake
    // -------------------------------------------------------------------------

    /// Gate a decoded message against the handshake state machine.
    pub fn gate(&self, msg: &Message) -> MessageGate {
        match msg {
            Message::Version(_) => {
                if self.version_received {
                    // Duplicate VERSION tolerated; nonce not re-latched
                    MessageGate::Ignore
                } else {
                    MessageGate::Allow
                }
            }
            Message::Verack => {
                if !self.version_received {
                    // Any message before VERSION is a violation
                    MessageGate::Reject(DisconnectReason::ProtocolViolation)
                } else if self.verack_received {
                    MessageGate::Ignore
                } else {
                    MessageGate::Allow
                }
            }
            _ => {
                if self.is_ready() {
                    MessageGate::Allow
                } else {
                    // Between VERSION and VERACK only VERACK itself may flow
                    MessageGate::Reject(DisconnectReason::ProtocolViolation)
                }
            }
        }
    }

    /// Latch the remote's VERSION fields. Caller has already passed the
    /// nonce-collision check.
    pub fn record_version(&mut self, payload: &VersionPayload) -> Result<(), DisconnectReason> {
        if payload.user_agent.len() > MAX_SUBVERSION_LENGTH {
            return Err(DisconnectReason::ProtocolViolation);
        }
        self.remote_nonce = payload.nonce;
        self.remote_services = payload.services;
        self.remote_start_height = payload.start_height;
        self.user_agent = payload.user_agent.clone();
        self.version_received = true;
        if self.state == PeerState::New || self.state == PeerState::VersionSent {
            self.state = PeerState::VersionReceived;
        }
        Ok(())
    }

    /// Record the remote's VERACK. Returns true when the peer just became
    /// READY.
    pub fn record_verack(&mut self) -> bool {
        self.verack_received = true;
        let was_ready = self.is_ready();
        self.update_ready();
        !was_ready && self.is_ready()
    }

    fn update_ready(&mut self) {
        if self.version_sent && self.version_received && self.verack_sent && self.verack_received
            && self.state != PeerState::Disconnected
        {
            self.state = PeerState::Ready;
        }
    }

    // -------------------------------------------------------------------------
    // Scoring and timers
    // -------------------------------------------------------------------------

    /// Add misbehavior points. Returns true when the score crossed the
    /// discouragement threshold and the peer is not NoBan — the caller then
    /// discourages the address and disconnects.
    pub fn misbehave(&mut self, points: u32, reason: &str) -> bool {
        self.misbehavior_score = self.misbehavior_score.saturating_add(points);
        warn!(
            peer = self.id,
            address = %self.address(),
            points,
            total = self.misbehavior_score,
            reason,
            "peer misbehaving"
        );
        self.misbehavior_score >= DISCOURAGE_THRESHOLD
            && !self.permissions.contains(NetPermissionFlags::NOBAN)
    }

    pub fn on_pong(&mut self, nonce: u64) {
        if self.ping_nonce == Some(nonce) {
            self.ping_nonce = None;
            self.last_pong_us = now_us();
        }
    }

    /// Keep-alive: ping when idle long enough and no ping is outstanding.
    pub fn needs_ping(&self, now_s: i64) -> bool {
        self.is_ready()
            && self.ping_nonce.is_none()
            && now_s.saturating_sub(self.last_message_us / 1_000_000) > PING_INTERVAL_SECS
    }

    /// Evaluate handshake/idle/ping deadlines.
    pub fn check_timeouts(&self, now_s: i64) -> Option<DisconnectReason> {
        if !self.is_ready() {
            if now_s.saturating_sub(self.connected_at) > HANDSHAKE_TIMEOUT_SECS {
                return Some(DisconnectReason::Timeout);
            }
            return None;
        }
        if now_s.saturating_sub(self.last_message_us / 1_000_000) > IDLE_TIMEOUT_SECS {
            return Some(DisconnectReason::Timeout);
        }
        if self.ping_nonce.is_some()
            && now_s.saturating_sub(self.last_ping_sent_us / 1_000_000) > PING_TIMEOUT_SECS
        {
            return Some(DisconnectReason::Timeout);
        }
        None
    }

    /// Tear down the connection and mark the peer dead. Actual removal from
    /// the registry is deferred to the reactor's reap pass so in-flight
    /// handler iterations never see a vanishing peer.
    pub fn disconnect(&mut self, reason: DisconnectReason) {
        if self.state != PeerState::Disconnected {
            debug!(peer = self.id, address = %self.address(), reason = reason.as_str(), "disconnecting");
            self.state = PeerState::Disconnected;
            self.conn.close();
        }
    }
}
