//! Network orchestrator: the reactor task that owns every manager
//!
//! All peer, sync, relay, and discovery state is owned by one `Reactor`
//! value that lives inside a single tokio task. Transport I/O tasks and the
//! public `NetworkManager` facade talk to it exclusively through channels,
//! which is what serializes every state mutation: between two awaits of the
//! reactor loop, no other code can observe intermediate state.
//!
//! Periodic work runs on four cadences, mirroring the managers they drive:
//! outbound top-up, 30 s maintenance, Poisson-scheduled feelers, and the
//! 1 s send-messages pass (initial-sync checks + INV flushes).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::chain::ChainState;
use crate::config::Config;
use crate::types::{Hash, now};

use super::block_relay::BlockRelayManager;
use super::discovery::{self, DiscoveryManager};
use super::dispatcher::MessageDispatcher;
use super::header_sync::HeaderSyncManager;
use super::message::{Message, VersionPayload, commands};
use super::peer::{MessageGate, Peer};
use super::peer_manager::PeerManager;
use super::transport::{Connection, Transport, TransportEvent};
use super::types::{
    CONNECT_INTERVAL_SECS, ConnectionType, DisconnectReason, FEELER_INTERVAL_SECS,
    MAINTENANCE_INTERVAL_SECS, NODE_NETWORK, NetPermissionFlags, NetworkAddress, PROTOCOL_VERSION,
    PeerId, SENDMESSAGES_INTERVAL_SECS,
};

/// Blocks older than this are not announced on connect (the peer will pull
/// them through headers sync if it cares).
const MAX_BLOCK_RELAY_AGE_SECS: i64 = 10 * 60;

// =============================================================================
// COMMANDS AND STATS
// =============================================================================

/// External requests into the reactor.
pub enum Command {
    ConnectTo {
        addr: SocketAddr,
        conn_type: ConnectionType,
        permissions: NetPermissionFlags,
    },
    /// A block joined the active chain (posted by the chainstate hook).
    BlockConnected { hash: Hash, timestamp: u32 },
    GetStats(oneshot::Sender<NetStats>),
    Stop(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub id: PeerId,
    pub address: SocketAddr,
    pub conn_type: &'static str,
    pub ready: bool,
    pub sync_started: bool,
    pub misbehavior_score: u32,
}

#[derive(Debug, Clone, Default)]
pub struct NetStats {
    pub peer_count: usize,
    pub outbound_count: usize,
    pub inbound_count: usize,
    pub sync_peer: Option<PeerId>,
    pub peers: Vec<PeerStatus>,
    pub addrman_size: usize,
}

// =============================================================================
// REACTOR
// =============================================================================

struct PendingConnect {
    addr: SocketAddr,
    conn_type: ConnectionType,
    permissions: NetPermissionFlags,
}

pub struct Reactor {
    config: Config,
    local_nonce: u64,
    chain: Arc<Mutex<ChainState>>,
    transport: Transport,
    peers: PeerManager,
    discovery: DiscoveryManager,
    header_sync: HeaderSyncManager,
    block_relay: BlockRelayManager,
    dispatcher: Arc<MessageDispatcher<Reactor>>,
    conn_to_peer: HashMap<u64, PeerId>,
    pending_connects: HashMap<u64, PendingConnect>,
    next_attempt_id: u64,
    listen_port: u16,
    running: bool,
}

impl Reactor {
    fn new(
        config: Config,
        local_nonce: u64,
        chain: Arc<Mutex<ChainState>>,
        transport: Transport,
        listen_port: u16,
    ) -> Self {
        let dispatcher = Arc::new(MessageDispatcher::new());
        register_handlers(&dispatcher);

        let mut peers = PeerManager::new(config.whitelist.clone());
        if let Err(err) = peers.load_bans(config.banlist_path()) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(%err, "could not load ban list");
            }
        }

        let mut discovery = DiscoveryManager::new();
        for seed in &config.seeds {
            discovery
                .addrman
                .add_seed(NetworkAddress::from_socket_addr(*seed, NODE_NETWORK));
        }

        Self {
            config,
            local_nonce,
            chain,
            transport,
            peers,
            discovery,
            header_sync: HeaderSyncManager::new(),
            block_relay: BlockRelayManager::new(),
            dispatcher,
            conn_to_peer: HashMap::new(),
            pending_connects: HashMap::new(),
            next_attempt_id: 1,
            listen_port,
            running: true,
        }
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        // Anchors first: the previous session's outbound peers get redialed
        // with NoBan before general outbound top-up competes for slots
        for anchor in discovery::load_anchors(self.config.anchors_path()) {
            let addr = anchor.socket_addr();
            info!(%addr, "connecting to anchor");
            self.initiate_connect(addr, ConnectionType::Outbound, NetPermissionFlags::NOBAN);
        }

        let mut connect_ticker =
            tokio::time::interval(Duration::from_secs(CONNECT_INTERVAL_SECS));
        let mut maintenance_ticker =
            tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
        let mut sendmessages_ticker =
            tokio::time::interval(Duration::from_secs(SENDMESSAGES_INTERVAL_SECS));
        let feeler_sleep = tokio::time::sleep(self.next_feeler_delay());
        tokio::pin!(feeler_sleep);

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_transport_event(event),
                        None => break,
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(Command::Stop(ack)) => {
                            self.shutdown();
                            let _ = ack.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command),
                        None => {
                            self.shutdown();
                            break;
                        }
                    }
                }
                _ = connect_ticker.tick() => self.attempt_outbound_connections(),
                _ = maintenance_ticker.tick() => self.run_maintenance(),
                _ = sendmessages_ticker.tick() => self.run_sendmessages(),
                _ = &mut feeler_sleep => {
                    self.attempt_feeler_connection();
                    let delay = self.next_feeler_delay();
                    feeler_sleep.as_mut().reset(tokio::time::Instant::now() + delay);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Transport events
    // -------------------------------------------------------------------------

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Accepted { conn } => self.on_inbound(conn),
            TransportEvent::ConnectResult { attempt_id, conn } => {
                self.on_connect_result(attempt_id, conn)
            }
            TransportEvent::Received { conn_id, bytes } => self.on_received(conn_id, &bytes),
            TransportEvent::Closed { conn_id } => self.on_closed(conn_id),
        }
    }

    fn on_inbound(&mut self, conn: Connection) {
        if !self.running {
            conn.close();
            return;
        }
        let remote = conn.remote_addr();
        if let Err(reason) = self.peers.admit_inbound(&remote.ip()) {
            debug!(%remote, reason, "rejecting inbound connection");
            conn.close();
            return;
        }
        let permissions = self.peers.inbound_permissions(&remote.ip());
        let id = self.peers.next_id();
        let peer = Peer::new(
            id,
            conn,
            ConnectionType::Inbound,
            permissions,
            self.config.network_magic,
        );
        self.conn_to_peer.insert(peer.conn_id(), id);
        self.peers.insert(peer);
        debug!(peer = id, %remote, "inbound peer registered");
        // Inbound handshake waits for the remote's VERSION
    }

    fn on_connect_result(&mut self, attempt_id: u64, conn: Option<Connection>) {
        let Some(pending) = self.pending_connects.remove(&attempt_id) else {
            if let Some(conn) = conn {
                conn.close();
            }
            return;
        };
        let Some(conn) = conn else {
            // Failure leaves the attempt count in place for backoff
            return;
        };
        if !self.running {
            conn.close();
            return;
        }

        let id = self.peers.next_id();
        let mut peer = Peer::new(
            id,
            conn,
            pending.conn_type,
            pending.permissions,
            self.config.network_magic,
        );
        self.conn_to_peer.insert(peer.conn_id(), id);
        self.discovery.addrman.mark_connected(&pending.addr);

        // Outbound opens the handshake
        let version = self.build_version(&peer);
        peer.send_message(&Message::Version(version));
        self.peers.insert(peer);
        debug!(peer = id, addr = %pending.addr, conn_type = pending.conn_type.as_str(), "outbound peer registered");
    }

    fn on_received(&mut self, conn_id: u64, bytes: &[u8]) {
        if !self.running {
            return;
        }
        let Some(&peer_id) = self.conn_to_peer.get(&conn_id) else { return };
        let messages = {
            let Some(peer) = self.peers.get_mut(peer_id) else { return };
            if !peer.is_connected() {
                return;
            }
            match peer.on_data(bytes) {
                Ok(messages) => messages,
                Err(reason) => {
                    peer.disconnect(reason);
                    return;
                }
            }
        };
        for msg in messages {
            let alive = self.peers.get(peer_id).map(|p| p.is_connected()).unwrap_or(false);
            if !alive {
                break;
            }
            self.process_message(peer_id, msg);
        }
    }

    fn on_closed(&mut self, conn_id: u64) {
        let Some(peer_id) = self.conn_to_peer.remove(&conn_id) else { return };
        let Some(removed) = self.peers.remove(peer_id) else { return };
        debug!(peer = peer_id, addr = %removed.address, "peer removed");

        self.discovery.on_peer_disconnected(peer_id);
        self.discovery.addrman.mark_disconnected(&removed.address);
        self.header_sync.on_peer_disconnected(peer_id);
        if removed.was_sync_peer && self.running {
            // Reselect without waiting for the next maintenance tick
            let chain = self.chain.clone();
            let chain = chain.lock().expect("chain lock");
            self.header_sync.check_initial_sync(&chain, &mut self.peers);
        }
    }

    // -------------------------------------------------------------------------
    // Message pipeline
    // -------------------------------------------------------------------------

    fn process_message(&mut self, peer_id: PeerId, msg: Message) {
        let gate = {
            let Some(peer) = self.peers.get(peer_id) else { return };
            peer.gate(&msg)
        };
        match gate {
            MessageGate::Ignore => return,
            MessageGate::Reject(reason) => {
                warn!(peer = peer_id, command = msg.command(), "message violates handshake state");
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.disconnect(reason);
                }
                return;
            }
            MessageGate::Allow => {}
        }

        // VERSION is consumed here, not dispatched: nonce collision checks
        // need the registry and the reply sequencing belongs to the peer
        if let Message::Version(payload) = &msg {
            self.on_version(peer_id, payload);
            return;
        }

        let dispatcher = self.dispatcher.clone();
        if !dispatcher.dispatch(self, peer_id, &msg) {
            trace!(peer = peer_id, command = msg.command(), "handler reported failure");
        }
    }

    fn on_version(&mut self, peer_id: PeerId, payload: &VersionPayload) {
        if !self.peers.check_incoming_nonce(payload.nonce, self.local_nonce) {
            info!(peer = peer_id, "nonce collision (self-connection or duplicate), disconnecting");
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.disconnect(DisconnectReason::NonceCollision);
            }
            return;
        }

        let send_version_reply = {
            let Some(peer) = self.peers.get_mut(peer_id) else { return };
            if let Err(reason) = peer.record_version(payload) {
                peer.disconnect(reason);
                return;
            }
            peer.is_inbound()
        };

        // Inbound answers VERSION with its own VERSION, then both sides ack
        if send_version_reply {
            let version = {
                let peer = self.peers.get(peer_id).expect("peer exists");
                self.build_version(peer)
            };
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.send_message(&Message::Version(version));
            }
        }
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.send_message(&Message::Verack);
        }
    }

    fn build_version(&self, peer: &Peer) -> VersionPayload {
        let height = self.chain.lock().expect("chain lock").height();
        VersionPayload {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK,
            timestamp: now(),
            addr_recv: NetworkAddress::from_socket_addr(peer.address(), 0),
            addr_from: NetworkAddress::new(
                "0.0.0.0".parse().expect("static addr"),
                self.listen_port,
                NODE_NETWORK,
            ),
            nonce: self.local_nonce,
            user_agent: format!("/obelisk:{}/", env!("CARGO_PKG_VERSION")),
            start_height: height,
        }
    }

    /// Peer reached READY: feelers hang up, outbound peers get mark-good
    /// plus a getaddr, everyone gets our tip.
    fn on_peer_ready(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.get(peer_id) else { return };
        let addr = peer.address();
        let conn_type = peer.conn_type;
        info!(peer = peer_id, %addr, conn_type = conn_type.as_str(), "handshake complete");

        if conn_type == ConnectionType::Feeler {
            // Liveness proven; that was the whole point
            self.discovery.addrman.mark_good(&addr);
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.disconnect(DisconnectReason::FeelerDone);
            }
            return;
        }
        if conn_type.is_outbound() {
            self.discovery.addrman.mark_good(&addr);
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.send_message(&Message::GetAddr);
            }
        }

        let chain = self.chain.clone();
        let chain = chain.lock().expect("chain lock");
        self.block_relay.announce_tip_to_peer(&chain, &mut self.peers, peer_id);
        self.header_sync.check_initial_sync(&chain, &mut self.peers);
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ConnectTo { addr, conn_type, permissions } => {
                self.initiate_connect(addr, conn_type, permissions);
            }
            Command::BlockConnected { hash, timestamp } => {
                self.on_block_connected(hash, timestamp);
            }
            Command::GetStats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Stop(_) => unreachable!("handled in run loop"),
        }
    }

    fn on_block_connected(&mut self, hash: Hash, timestamp: u32) {
        // Relay gate: catching-up nodes and stale blocks stay quiet
        let in_ibd = self.chain.lock().expect("chain lock").is_initial_block_download();
        if in_ibd {
            return;
        }
        if (timestamp as i64) < now() - MAX_BLOCK_RELAY_AGE_SECS {
            return;
        }
        self.block_relay.relay_block(&mut self.peers, hash);
    }

    fn stats(&self) -> NetStats {
        NetStats {
            peer_count: self.peers.count(),
            outbound_count: self.peers.outbound_count(),
            inbound_count: self.peers.inbound_count(),
            sync_peer: self.header_sync.sync_peer_id(),
            peers: self
                .peers
                .iter()
                .map(|p| PeerStatus {
                    id: p.id,
                    address: p.address(),
                    conn_type: p.conn_type.as_str(),
                    ready: p.is_ready(),
                    sync_started: p.sync_started,
                    misbehavior_score: p.misbehavior_score,
                })
                .collect(),
            addrman_size: self.discovery.addrman.len(),
        }
    }

    // -------------------------------------------------------------------------
    // Periodic tasks
    // -------------------------------------------------------------------------

    fn initiate_connect(
        &mut self,
        addr: SocketAddr,
        conn_type: ConnectionType,
        permissions: NetPermissionFlags,
    ) {
        if !self.running {
            return;
        }
        // One outbound per address, including attempts still in flight
        if self.peers.has_outbound_to(&addr)
            || self.pending_connects.values().any(|p| p.addr == addr)
        {
            return;
        }
        let attempt_id = self.next_attempt_id;
        self.next_attempt_id += 1;
        self.discovery.addrman.mark_attempt(&addr);
        self.pending_connects
            .insert(attempt_id, PendingConnect { addr, conn_type, permissions });
        trace!(%addr, conn_type = conn_type.as_str(), "dialing");
        self.transport.connect(attempt_id, addr);
    }

    /// Top up outbound slots from the address table.
    fn attempt_outbound_connections(&mut self) {
        if !self.running {
            return;
        }
        let active = self.peers.outbound_count()
            + self
                .pending_connects
                .values()
                .filter(|p| p.conn_type == ConnectionType::Outbound)
                .count();
        if active >= self.config.outbound_target {
            return;
        }
        let want = self.config.outbound_target - active;
        for _ in 0..want {
            let Some(candidate) = self.discovery.addrman.select(false) else { break };
            let addr = candidate.socket_addr();
            if self.peers.is_banned(&addr.ip()) || self.peers.is_discouraged(&addr.ip()) {
                continue;
            }
            self.initiate_connect(addr, ConnectionType::Outbound, NetPermissionFlags::NONE);
        }
    }

    fn run_maintenance(&mut self) {
        if !self.running {
            return;
        }
        self.peers.process_periodic();
        self.header_sync.process_timers(&mut self.peers);
        self.peers.sweep_expired();
        self.discovery.sweep();

        let chain = self.chain.clone();
        let chain = chain.lock().expect("chain lock");
        self.block_relay.announce_tip_to_all_peers(&chain, &mut self.peers);
        self.header_sync.check_initial_sync(&chain, &mut self.peers);
    }

    fn run_sendmessages(&mut self) {
        if !self.running {
            return;
        }
        {
            let chain = self.chain.clone();
            let chain = chain.lock().expect("chain lock");
            self.header_sync.check_initial_sync(&chain, &mut self.peers);
        }
        self.block_relay.flush_block_announcements(&mut self.peers);
    }

    fn attempt_feeler_connection(&mut self) {
        if !self.running {
            return;
        }
        let Some(candidate) = self.discovery.addrman.select(true) else { return };
        let addr = candidate.socket_addr();
        debug!(%addr, "feeler probe");
        self.initiate_connect(addr, ConnectionType::Feeler, NetPermissionFlags::NONE);
    }

    /// Exponential (Poisson-process) delay around the mean feeler interval,
    /// optionally capped for tests.
    fn next_feeler_delay(&self) -> Duration {
        let uniform: f64 = rand::random::<f64>().max(f64::MIN_POSITIVE);
        let mut delay_s = -uniform.ln() * FEELER_INTERVAL_SECS as f64;
        if self.config.feeler_max_delay_multiplier > 0.0 {
            delay_s = delay_s.min(self.config.feeler_max_delay_multiplier * FEELER_INTERVAL_SECS as f64);
        }
        Duration::from_secs_f64(delay_s.max(1.0))
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    fn shutdown(&mut self) {
        info!("network shutting down");
        // Order matters: stop reacting, persist anchors while peers are
        // still known, then tear connections down and stop the listener
        self.running = false;

        let anchors = self.peers.select_anchors();
        if !anchors.is_empty() {
            if let Err(err) = discovery::save_anchors(self.config.anchors_path(), &anchors) {
                warn!(%err, "failed to save anchors");
            }
        }
        if let Err(err) = self.peers.save_bans(self.config.banlist_path()) {
            warn!(%err, "failed to save ban list");
        }

        self.peers.disconnect_all();
        self.transport.stop();
    }
}

// =============================================================================
// HANDLER REGISTRATION
// =============================================================================

fn register_handlers(dispatcher: &MessageDispatcher<Reactor>) {
    dispatcher.register(commands::VERACK, handle_verack);
    dispatcher.register(commands::PING, handle_ping);
    dispatcher.register(commands::PONG, handle_pong);
    dispatcher.register(commands::ADDR, handle_addr);
    dispatcher.register(commands::GETADDR, handle_getaddr);
    dispatcher.register(commands::INV, handle_inv);
    dispatcher.register(commands::HEADERS, handle_headers);
    dispatcher.register(commands::GETHEADERS, handle_getheaders);
}

fn handle_verack(r: &mut Reactor, peer_id: PeerId, _msg: &Message) -> bool {
    let became_ready = match r.peers.get_mut(peer_id) {
        Some(peer) => peer.record_verack(),
        None => return false,
    };
    if became_ready {
        r.on_peer_ready(peer_id);
    }
    true
}

fn handle_ping(r: &mut Reactor, peer_id: PeerId, msg: &Message) -> bool {
    let Message::Ping(nonce) = msg else { return false };
    match r.peers.get_mut(peer_id) {
        Some(peer) => peer.send_message(&Message::Pong(*nonce)),
        None => false,
    }
}

fn handle_pong(r: &mut Reactor, peer_id: PeerId, msg: &Message) -> bool {
    let Message::Pong(nonce) = msg else { return false };
    if let Some(peer) = r.peers.get_mut(peer_id) {
        peer.on_pong(*nonce);
    }
    true
}

fn handle_addr(r: &mut Reactor, peer_id: PeerId, msg: &Message) -> bool {
    let Message::Addr(addrs) = msg else { return false };
    let Some(source) = r.peers.get(peer_id).map(|p| p.address()) else { return false };
    r.discovery.handle_addr(peer_id, source, addrs);
    true
}

fn handle_getaddr(r: &mut Reactor, peer_id: PeerId, msg: &Message) -> bool {
    let Message::GetAddr = msg else { return false };
    if let Some(response) = r.discovery.handle_getaddr(&r.peers, peer_id) {
        if let Some(peer) = r.peers.get_mut(peer_id) {
            peer.send_message(&Message::Addr(response));
        }
    }
    true
}

fn handle_inv(r: &mut Reactor, peer_id: PeerId, msg: &Message) -> bool {
    let Message::Inv(items) = msg else { return false };
    if !recheck_ready(r, peer_id) {
        return false;
    }
    let chain = r.chain.clone();
    let chain = chain.lock().expect("chain lock");
    r.block_relay
        .handle_inv(&chain, &mut r.peers, &mut r.header_sync, peer_id, items)
}

fn handle_headers(r: &mut Reactor, peer_id: PeerId, msg: &Message) -> bool {
    let Message::Headers(headers) = msg else { return false };
    if !recheck_ready(r, peer_id) {
        return false;
    }
    let chain = r.chain.clone();
    let mut chain = chain.lock().expect("chain lock");
    r.header_sync
        .handle_headers(&mut chain, &mut r.peers, peer_id, headers)
}

fn handle_getheaders(r: &mut Reactor, peer_id: PeerId, msg: &Message) -> bool {
    let Message::GetHeaders(payload) = msg else { return false };
    if !recheck_ready(r, peer_id) {
        return false;
    }
    let chain = r.chain.clone();
    let chain = chain.lock().expect("chain lock");
    r.header_sync
        .handle_getheaders(&chain, &mut r.peers, peer_id, payload)
}

/// Protocol handlers re-verify readiness; a pre-READY protocol message is
/// an immediate disconnect (the handshake gate normally fires first).
fn recheck_ready(r: &mut Reactor, peer_id: PeerId) -> bool {
    let ready = r.peers.get(peer_id).map(|p| p.is_ready()).unwrap_or(false);
    if !ready {
        if let Some(peer) = r.peers.get_mut(peer_id) {
            peer.disconnect(DisconnectReason::ProtocolViolation);
        }
    }
    ready
}

// =============================================================================
// PUBLIC FACADE
// =============================================================================

/// Handle to a running network core. Cheap to clone channel-wise; `stop`
/// performs the ordered shutdown and joins the reactor task.
pub struct NetworkManager {
    commands: mpsc::UnboundedSender<Command>,
    listen_port: u16,
    local_nonce: u64,
    task: Option<JoinHandle<()>>,
    nat: Option<super::nat::NatManager>,
}

impl NetworkManager {
    /// Bind, wire the chainstate subscription, and spawn the reactor.
    pub async fn start(config: Config, chain: Arc<Mutex<ChainState>>) -> std::io::Result<Self> {
        Self::start_with_port_mapper(config, chain, None).await
    }

    /// As `start`, with an external port-mapping side effect for the NAT
    /// refresh task.
    pub async fn start_with_port_mapper(
        config: Config,
        chain: Arc<Mutex<ChainState>>,
        port_mapper: Option<Arc<dyn super::nat::PortMapper>>,
    ) -> std::io::Result<Self> {
        let (mut manager, reactor) = Self::start_detached(config, chain, port_mapper).await?;
        manager.task = Some(tokio::spawn(reactor));
        Ok(manager)
    }

    /// Bind and construct WITHOUT spawning the reactor task. This is the
    /// `io_threads = 0` mode: the embedder (a test harness) owns the
    /// reactor future and drives it itself, so event processing can be
    /// interleaved deterministically with assertions.
    pub async fn start_detached(
        config: Config,
        chain: Arc<Mutex<ChainState>>,
        port_mapper: Option<Arc<dyn super::nat::PortMapper>>,
    ) -> std::io::Result<(Self, impl std::future::Future<Output = ()> + Send)> {
        let local_nonce = config.test_nonce.unwrap_or_else(rand::random);
        std::fs::create_dir_all(&config.datadir)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let mut transport = Transport::new(event_tx);
        let listen_port = if config.listen_enabled {
            transport.listen(config.listen_port).await?
        } else {
            0
        };
        info!(
            port = listen_port,
            nonce = local_nonce,
            "network starting"
        );

        // Chainstate subscription: connected blocks hop onto the reactor,
        // which applies the IBD/age relay gates
        {
            let cmd_tx = cmd_tx.clone();
            let mut chain_guard = chain.lock().expect("chain lock");
            chain_guard.on_block_connected(move |header, _height| {
                let _ = cmd_tx.send(Command::BlockConnected {
                    hash: header.hash(),
                    timestamp: header.timestamp,
                });
            });
        }

        let nat = match (config.enable_nat, port_mapper) {
            (true, Some(mapper)) => Some(super::nat::NatManager::start(mapper, listen_port)),
            (true, None) => {
                warn!("NAT refresh enabled but no port mapper supplied");
                None
            }
            _ => None,
        };

        let seeds = config.seeds.clone();
        let reactor = Reactor::new(config, local_nonce, chain, transport, listen_port);
        let run = reactor.run(event_rx, cmd_rx);

        let manager = Self { commands: cmd_tx, listen_port, local_nonce, task: None, nat };
        // Seeds are regular outbound dials, queued immediately rather than
        // waiting for the first connect tick
        for seed in seeds {
            manager.connect_to(seed);
        }
        Ok((manager, run))
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn local_nonce(&self) -> u64 {
        self.local_nonce
    }

    pub fn connect_to(&self, addr: SocketAddr) {
        let _ = self.commands.send(Command::ConnectTo {
            addr,
            conn_type: ConnectionType::Outbound,
            permissions: NetPermissionFlags::NONE,
        });
    }

    pub fn connect_to_manual(&self, addr: SocketAddr) {
        let _ = self.commands.send(Command::ConnectTo {
            addr,
            conn_type: ConnectionType::Manual,
            permissions: NetPermissionFlags::NOBAN,
        });
    }

    pub async fn stats(&self) -> Option<NetStats> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::GetStats(tx)).ok()?;
        rx.await.ok()
    }

    /// Ordered shutdown: the reactor persists anchors and bans, closes
    /// every peer, stops the listener, then exits; the NAT task is torn
    /// down last.
    pub async fn stop(&mut self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(mut nat) = self.nat.take() {
            nat.stop();
        }
    }
}
