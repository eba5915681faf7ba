//! The sync handler: an authenticated message mesh between bot instances.
//!
//! One inbound TLS listener accepts any number of peers; one outbound
//! client dials peers in table order, one connection at a time. Every
//! accepted frame is deduplicated by (source, id), relayed verbatim to
//! every other open connection, then dispatched to its handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use serde::Serialize;

use crate::cache::AddressCache;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::message::{self, Envelope, Hello, InstanceInfo, Message};
use crate::peer::{Peer, PeerTable};
use crate::registry::{CacheScope, ConfigCacheSink, ModuleDescriptor, ModuleRegistry};
use crate::tls::TlsIdentity;

/// Outbound frame queue per connection. A peer that stops draining gets
/// backpressure, not unbounded memory.
const WRITE_QUEUE: usize = 64;

pub(crate) struct State {
    pub(crate) peers: PeerTable,
    pub(crate) controller: Option<String>,
    pub(crate) conns: HashMap<u64, ConnHandle>,
    pub(crate) cache: AddressCache,
}

pub(crate) struct ConnHandle {
    pub(crate) tx: mpsc::Sender<Vec<u8>>,
    #[allow(dead_code)]
    pub(crate) peer: Option<String>,
}

pub(crate) enum Direction {
    Inbound,
    Outbound { dialed: String },
}

/// One node of the sync mesh. Clone is cheap; all clones share state.
#[derive(Clone)]
pub struct SyncHandler {
    pub(crate) config: Arc<SyncConfig>,
    pub(crate) registry: Arc<dyn ModuleRegistry>,
    pub(crate) sink: Arc<dyn ConfigCacheSink>,
    pub(crate) state: Arc<Mutex<State>>,
    msg_id: Arc<AtomicU64>,
    next_conn_id: Arc<AtomicU64>,
    change_tx: Arc<watch::Sender<u64>>,
}

/// Read-only snapshot for the operator debug surface.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub instance: String,
    pub controller: Option<String>,
    pub peers: Vec<PeerStatus>,
    pub modules: Vec<ModuleStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub name: String,
    pub address: Option<String>,
    pub priority: i64,
    pub alive: bool,
    pub known_dead: bool,
    pub last_message_id: u64,
    pub handling: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatus {
    pub name: String,
    pub available: bool,
    pub handler: Option<String>,
}

impl SyncHandler {
    pub fn new(
        config: SyncConfig,
        registry: Arc<dyn ModuleRegistry>,
        sink: Arc<dyn ConfigCacheSink>,
    ) -> Self {
        let (cache, cache_err) = AddressCache::load(&config.cache_path);
        if let Some(e) = cache_err {
            warn!("peer address cache ignored: {e}");
        }

        let mut self_peer = Peer::named(&config.instance);
        self_peer.address = config.my_address.clone();
        self_peer.priority = config.priority;
        self_peer.last_seen = Some(Instant::now());
        let mut peers = PeerTable::new(self_peer);

        for (name, address) in cache.entries() {
            if name != config.instance {
                peers.insert(Peer::with_address(name, address));
            }
        }
        // Statically configured endpoints come in under their address
        // until the hello tells us who actually lives there.
        for address in &config.peers {
            let already = peers
                .iter()
                .any(|p| p.address.as_deref() == Some(address.as_str()));
            if !already {
                peers.insert(Peer::with_address(address.clone(), address.clone()));
            }
        }

        let (change_tx, _) = watch::channel(0);
        SyncHandler {
            config: Arc::new(config),
            registry,
            sink,
            state: Arc::new(Mutex::new(State {
                peers,
                controller: None,
                conns: HashMap::new(),
                cache,
            })),
            msg_id: Arc::new(AtomicU64::new(1)),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            change_tx: Arc::new(change_tx),
        }
    }

    /// Bind the listener and spawn the background tasks. Only the bind
    /// itself can fail; everything after is survived and logged.
    pub async fn start(&self, tls: TlsIdentity) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        info!(
            "sync mesh listening on port {} as {}",
            self.config.port, self.config.instance
        );

        let tls = Arc::new(tls);
        let acceptor = tls.acceptor();
        let this = self.clone();
        tokio::spawn(async move { this.accept_loop(listener, acceptor).await });

        let connector = tls.connector();
        let this = self.clone();
        tokio::spawn(async move { this.outbound_loop(connector).await });

        let this = self.clone();
        tokio::spawn(async move { this.heartbeat_loop().await });

        let this = self.clone();
        tokio::spawn(async move { this.check_loop().await });

        Ok(())
    }

    /// Ticks whenever the peer set or the controller changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.change_tx.subscribe()
    }

    pub(crate) fn notify_change(&self) {
        self.change_tx.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Entry point for the configuration collaborator: fan an expiry
    /// notice out to the mesh. The local cache is the caller's business.
    pub async fn broadcast_expire(&self, config: &str, scope: CacheScope, id: &str) {
        self.broadcast(Message::ExpireConfigCache {
            config: config.to_string(),
            scope,
            id: id.to_string(),
        })
        .await;
    }

    pub async fn status(&self) -> SyncStatus {
        let state = self.state.lock().await;
        let now = Instant::now();
        let peers = state
            .peers
            .iter()
            .map(|p| PeerStatus {
                name: p.name.clone(),
                address: p.address.clone(),
                priority: p.priority,
                alive: p.name == self.config.instance
                    || p.alive(now, &self.config.timings),
                known_dead: p.known_dead,
                last_message_id: p.last_message_id,
                handling: p.handled_modules(),
            })
            .collect();
        let modules = self
            .registry
            .modules()
            .into_iter()
            .map(|m| ModuleStatus {
                name: m.name,
                available: m.available,
                handler: m.handler,
            })
            .collect();
        SyncStatus {
            instance: self.config.instance.clone(),
            controller: state.controller.clone(),
            peers,
            modules,
        }
    }

    // ── Outbound frames ──

    fn next_id(&self) -> u64 {
        self.msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Encode under our own envelope and send to every open connection.
    pub(crate) async fn broadcast(&self, message: Message) {
        let envelope = Envelope {
            source: self.config.instance.clone(),
            id: self.next_id(),
        };
        let frame = match message::encode(&envelope, &message) {
            Ok(frame) => frame,
            Err(e) => {
                error!("failed to encode {}: {e}", message.kind());
                return;
            }
        };
        let txs: Vec<_> = {
            let state = self.state.lock().await;
            state.conns.values().map(|c| c.tx.clone()).collect()
        };
        for tx in txs {
            let _ = tx.send(frame.clone()).await;
        }
    }

    fn hello_frame(&self) -> Result<Vec<u8>> {
        let envelope = Envelope {
            source: self.config.instance.clone(),
            id: 0,
        };
        message::encode(
            &envelope,
            &Message::Hello(Hello {
                version: self.config.version.clone(),
                env: self.config.env,
                user_id: self.config.user_id.clone(),
            }),
        )
    }

    pub(crate) fn instance_info_message(&self) -> Message {
        Message::InstanceInfo(InstanceInfo {
            address: self.config.my_address.clone(),
            priority: self.config.priority,
        })
    }

    pub(crate) fn module_info_message(&self) -> Message {
        let modules = self
            .registry
            .modules()
            .into_iter()
            .map(|m| ModuleDescriptor {
                handling: m.handled_by(&self.config.instance),
                name: m.name,
                available: m.available,
            })
            .collect();
        Message::ModuleInfo { modules }
    }

    // ── Connections ──

    async fn accept_loop(self, listener: TcpListener, acceptor: tokio_rustls::TlsAcceptor) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let this = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let handshake = this.config.timings.handshake_timeout;
                let tls_stream = match timeout(handshake, acceptor.accept(stream)).await {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => {
                        debug!("tls accept from {addr}: {e}");
                        return;
                    }
                    Err(_) => {
                        debug!("tls accept from {addr} timed out");
                        return;
                    }
                };
                if let Err(e) = this.run_connection(tls_stream, Direction::Inbound).await {
                    log_conn_end("inbound", &addr.to_string(), &e);
                }
            });
        }
    }

    /// Walk the peer table in insertion order, one outbound connection at
    /// a time. An established connection blocks the walk until it closes.
    async fn outbound_loop(self, connector: TlsConnector) {
        loop {
            let names = {
                let state = self.state.lock().await;
                state.peers.names_in_order()
            };
            let mut any_open = false;
            for name in names {
                let address = {
                    let state = self.state.lock().await;
                    match state.peers.get(&name) {
                        Some(p) if p.name != self.config.instance => p.address.clone(),
                        _ => None,
                    }
                };
                let Some(address) = address else { continue };
                match self.dial(&connector, &name, &address).await {
                    Ok(()) => any_open = true,
                    Err(SyncError::SelfLoop) => {
                        debug!("{address} is ourselves, dropping the entry");
                        let mut state = self.state.lock().await;
                        state.peers.remove(&name);
                        if let Err(e) = state.cache.remove(&name) {
                            warn!("address cache: {e}");
                        }
                    }
                    Err(e) => log_conn_end("outbound", &address, &e),
                }
            }
            if !any_open {
                tokio::time::sleep(self.config.timings.give_up).await;
                if !self.has_live_peer().await {
                    self.solo_fallback().await;
                }
            }
            tokio::time::sleep(self.config.timings.peer_retry).await;
        }
    }

    async fn dial(&self, connector: &TlsConnector, name: &str, address: &str) -> Result<()> {
        let handshake = self.config.timings.handshake_timeout;
        let tcp = timeout(handshake, TcpStream::connect(address))
            .await
            .map_err(|_| SyncError::HandshakeTimeout)??;
        let _ = tcp.set_nodelay(true);
        let stream = timeout(handshake, connector.connect(TlsIdentity::server_name(), tcp))
            .await
            .map_err(|_| SyncError::HandshakeTimeout)??;
        self.run_connection(
            stream,
            Direction::Outbound {
                dialed: name.to_string(),
            },
        )
        .await
    }

    /// Drive one connection from hello to close. Generic over the stream
    /// so tests can run the full protocol over an in-memory pipe.
    pub(crate) async fn run_connection<S>(&self, stream: S, direction: Direction) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let hello = self.hello_frame()?;

        // Hello first, in both directions. The server answers only after
        // the client's hello passed every gate.
        let source = match &direction {
            Direction::Outbound { .. } => {
                write_half.write_all(&hello).await?;
                write_half.flush().await?;
                self.read_hello(&mut reader).await?
            }
            Direction::Inbound => {
                let source = self.read_hello(&mut reader).await?;
                write_half.write_all(&hello).await?;
                write_half.flush().await?;
                source
            }
        };

        self.register_after_hello(&direction, &source).await?;

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE);
        {
            let mut state = self.state.lock().await;
            state.conns.insert(
                conn_id,
                ConnHandle {
                    tx,
                    peer: Some(source.clone()),
                },
            );
        }
        let writer = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
                if write_half.flush().await.is_err() {
                    break;
                }
            }
        });

        info!("connected to peer {source}");
        self.after_hello(&direction).await;

        let result = self.read_loop(&mut reader, conn_id).await;

        {
            let mut state = self.state.lock().await;
            state.conns.remove(&conn_id);
        }
        writer.abort();
        debug!("connection to {source} closed");
        result
    }

    async fn read_hello<R>(&self, reader: &mut R) -> Result<String>
    where
        R: AsyncBufRead + Unpin,
    {
        let frame = timeout(
            self.config.timings.handshake_timeout,
            message::read_frame(reader),
        )
        .await
        .map_err(|_| SyncError::HandshakeTimeout)??
        .ok_or_else(|| SyncError::Protocol("closed before hello".into()))?;

        let (envelope, msg) = message::decode(&frame)?;
        let Message::Hello(hello) = msg else {
            return Err(SyncError::Protocol(format!(
                "first frame was {}, not hello",
                msg.kind()
            )));
        };
        if envelope.source == self.config.instance {
            return Err(SyncError::SelfLoop);
        }
        if hello.version != self.config.version {
            return Err(SyncError::IdentityMismatch {
                field: "version",
                ours: self.config.version.clone(),
                theirs: hello.version,
            });
        }
        if hello.env != self.config.env {
            return Err(SyncError::IdentityMismatch {
                field: "env",
                ours: self.config.env.to_string(),
                theirs: hello.env.to_string(),
            });
        }
        if hello.user_id != self.config.user_id {
            return Err(SyncError::IdentityMismatch {
                field: "userId",
                ours: self.config.user_id.clone(),
                theirs: hello.user_id,
            });
        }
        Ok(envelope.source)
    }

    /// Table upkeep once the remote identity is known: rename a dialed
    /// placeholder to the announced name, persist the address, mark the
    /// peer seen.
    async fn register_after_hello(&self, direction: &Direction, source: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Direction::Outbound { dialed } = direction {
            if dialed != source {
                state.peers.rename(dialed, source)?;
                info!("peer {dialed} announced itself as {source}, rekeyed");
                if let Err(e) = state.cache.remove(dialed) {
                    warn!("address cache: {e}");
                }
            }
        }
        let peer = state.peers.get_or_insert(source);
        peer.last_seen = Some(Instant::now());
        peer.known_dead = false;
        let address = peer.address.clone();
        if let Some(address) = address {
            if let Err(e) = state.cache.upsert(source, &address) {
                warn!("address cache: {e}");
            }
        }
        drop(state);
        self.notify_change();
        Ok(())
    }

    /// Announce ourselves on the fresh link: instance info and the module
    /// list, plus the preferred-module requests on our own dials.
    async fn after_hello(&self, direction: &Direction) {
        self.broadcast(self.instance_info_message()).await;
        self.broadcast(self.module_info_message()).await;
        if matches!(direction, Direction::Outbound { .. }) {
            for module in &self.config.preferred_modules {
                self.broadcast(Message::RequestModule {
                    module: module.clone(),
                })
                .await;
            }
        }
    }

    async fn read_loop<R>(&self, reader: &mut R, conn_id: u64) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            let Some(frame) = message::read_frame(reader).await? else {
                return Ok(());
            };
            match self.handle_frame(&frame, Some(conn_id)).await {
                Ok(()) => {}
                // Malformed traffic kills the connection; handler-level
                // trouble (unknown names in bodies) does not.
                Err(e @ (SyncError::Protocol(_) | SyncError::Codec(_))) => return Err(e),
                Err(SyncError::UnknownPeer(name)) => {
                    warn!("message referenced unknown peer {name}, ignored");
                }
                Err(SyncError::UnknownModule(name)) => {
                    error!("message referenced unknown module {name}, ignored");
                }
                Err(SyncError::RankParadox(peer)) => {
                    error!("controlSwitch to {peer} which we outrank, ignored");
                }
                Err(e) => warn!("handler error: {e}"),
            }
        }
    }

    /// Dedup, relay, dispatch. `origin` is the connection the frame came
    /// in on; `None` means locally injected (tests).
    pub(crate) async fn handle_frame(&self, frame: &[u8], origin: Option<u64>) -> Result<()> {
        let (envelope, msg) = message::decode(frame)?;
        if matches!(msg, Message::Hello(_)) {
            return Err(SyncError::Protocol("hello after handshake".into()));
        }
        // Our own frame returned over some cycle in the mesh.
        if envelope.source == self.config.instance {
            return Ok(());
        }

        let targets = {
            let mut state = self.state.lock().await;
            let peer = state.peers.get_or_insert(&envelope.source);
            if envelope.id <= peer.last_message_id {
                debug!(
                    "duplicate {} id={} from {}, dropped",
                    msg.kind(),
                    envelope.id,
                    envelope.source
                );
                return Ok(());
            }
            peer.last_message_id = envelope.id;
            peer.last_seen = Some(Instant::now());
            if matches!(msg, Message::Heartbeat | Message::InstanceInfo(_)) {
                peer.known_dead = false;
            }
            state
                .conns
                .iter()
                .filter(|(id, _)| Some(**id) != origin)
                .map(|(_, c)| c.tx.clone())
                .collect::<Vec<_>>()
        };
        for tx in targets {
            let _ = tx.send(frame.to_vec()).await;
        }

        self.dispatch(envelope, msg).await
    }

    async fn dispatch(&self, envelope: Envelope, message: Message) -> Result<()> {
        match message {
            Message::Hello(_) | Message::Heartbeat => Ok(()),
            Message::InstanceInfo(info) => self.on_instance_info(&envelope.source, info).await,
            Message::LostPeer { name } => self.on_lost_peer(&envelope.source, &name).await,
            Message::AssignModule { peer, module } => {
                self.on_assign_module(&peer, &module).await
            }
            Message::RequestModule { module } => {
                self.on_request_module(&envelope.source, &module).await
            }
            Message::ControlSwitch { controller } => {
                self.on_control_switch(&envelope.source, &controller).await
            }
            Message::ModuleInfo { modules } => {
                self.on_module_info(&envelope.source, modules).await
            }
            Message::ExpireConfigCache { config, scope, id } => {
                self.sink.expire_cache(&config, scope, &id);
                Ok(())
            }
        }
    }

    async fn on_lost_peer(&self, source: &str, name: &str) -> Result<()> {
        if name == self.config.instance {
            warn!("peer {source} announced us dead, ignoring");
            return Ok(());
        }
        let handled = {
            let mut state = self.state.lock().await;
            let Some(peer) = state.peers.get_mut(name) else {
                return Err(SyncError::UnknownPeer(name.to_string()));
            };
            if peer.known_dead {
                return Ok(());
            }
            peer.known_dead = true;
            peer.last_message_id = 0;
            info!("peer {name} reported lost by {source}");
            peer.handled_modules()
        };
        self.notify_change();
        self.dead_peer_fallout(name, handled).await;
        Ok(())
    }

    // ── Periodic tasks ──

    async fn heartbeat_loop(self) {
        let mut ticker = tokio::time::interval(self.config.timings.heartbeat_interval);
        loop {
            ticker.tick().await;
            self.broadcast(Message::Heartbeat).await;
        }
    }

    async fn check_loop(self) {
        let period = self.config.timings.check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            self.check_tick().await;
        }
    }

    /// One liveness / election / reconciliation pass.
    pub(crate) async fn check_tick(&self) {
        // Death detection first, so election and reconciliation see it.
        let dead = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let timings = self.config.timings;
            let names = state.peers.names_in_order();
            let mut found = Vec::new();
            for name in names {
                if name == self.config.instance {
                    continue;
                }
                let Some(peer) = state.peers.get_mut(&name) else {
                    continue;
                };
                // Entries that were never live are not deaths.
                if peer.known_dead || peer.last_seen.is_none() {
                    continue;
                }
                if !peer.alive(now, &timings) {
                    peer.known_dead = true;
                    // A returning peer starts its counter over.
                    peer.last_message_id = 0;
                    found.push((name, peer.handled_modules()));
                }
            }
            found
        };
        for (name, _) in &dead {
            warn!("peer {name} missed its heartbeat window, marking dead");
            self.broadcast(Message::LostPeer { name: name.clone() }).await;
            self.notify_change();
        }

        if self.is_controller().await {
            for (name, handled) in dead {
                self.dead_peer_fallout(&name, handled).await;
            }
            self.reconcile_modules().await;
        } else {
            self.election_check().await;
        }
    }

    pub(crate) async fn is_controller(&self) -> bool {
        let state = self.state.lock().await;
        state.controller.as_deref() == Some(self.config.instance.as_str())
    }

    pub(crate) async fn has_live_peer(&self) -> bool {
        let state = self.state.lock().await;
        let now = Instant::now();
        !state
            .peers
            .live_remote(now, &self.config.timings)
            .is_empty()
    }
}

fn log_conn_end(direction: &str, endpoint: &str, err: &SyncError) {
    match err {
        SyncError::SelfLoop => {}
        SyncError::IdentityMismatch { .. } => {
            warn!("{direction} {endpoint} refused: {err}");
        }
        SyncError::Protocol(_) | SyncError::Codec(_) | SyncError::RenameCollision(_) => {
            warn!("{direction} {endpoint} closed: {err}");
        }
        _ => debug!("{direction} {endpoint}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunEnv;
    use crate::testutil::{expire_frame, frame, TestNode};

    async fn wait_for<F, Fut>(check: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..400 {
            if check().await {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    /// Wire two handlers together over an in-memory pipe, a dialing b.
    fn link(
        a: &TestNode,
        b: &TestNode,
        dialed: &str,
    ) -> (
        tokio::task::JoinHandle<Result<()>>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (sa, sb) = tokio::io::duplex(256 * 1024);
        let ha = a.handler.clone();
        let hb = b.handler.clone();
        let dialed = dialed.to_string();
        let ta =
            tokio::spawn(async move { ha.run_connection(sa, Direction::Outbound { dialed }).await });
        let tb = tokio::spawn(async move { hb.run_connection(sb, Direction::Inbound).await });
        (ta, tb)
    }

    #[tokio::test]
    async fn hello_exchange_registers_and_renames() {
        let a = TestNode::new("node-a");
        let b = TestNode::new("node-b");
        {
            let mut state = a.handler.state.lock().await;
            state
                .peers
                .insert(Peer::with_address("10.0.0.9:4000", "10.0.0.9:4000"));
        }

        let _links = link(&a, &b, "10.0.0.9:4000");

        wait_for(|| async {
            let s = a.handler.status().await;
            s.peers.iter().any(|p| p.name == "node-b")
        })
        .await;
        wait_for(|| async {
            let s = b.handler.status().await;
            s.peers.iter().any(|p| p.name == "node-a")
        })
        .await;

        // The placeholder was rekeyed, keeping the dialed address.
        let status = a.handler.status().await;
        assert!(!status.peers.iter().any(|p| p.name == "10.0.0.9:4000"));
        let renamed = status.peers.iter().find(|p| p.name == "node-b").unwrap();
        assert_eq!(renamed.address.as_deref(), Some("10.0.0.9:4000"));

        // And persisted under the new name.
        let state = a.handler.state.lock().await;
        assert_eq!(state.cache.get("node-b"), Some("10.0.0.9:4000"));
        assert_eq!(state.cache.get("10.0.0.9:4000"), None);
    }

    #[tokio::test]
    async fn expire_notice_reaches_the_remote_sink_once() {
        let a = TestNode::new("node-a");
        let b = TestNode::new("node-b");
        let _links = link(&a, &b, "node-b");

        wait_for(|| async {
            b.handler
                .status()
                .await
                .peers
                .iter()
                .any(|p| p.name == "node-a")
        })
        .await;

        a.handler
            .broadcast_expire("greeting", CacheScope::Guild, "9001")
            .await;

        wait_for(|| async { !b.sink.calls().is_empty() }).await;
        let calls = b.sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            ("greeting".to_string(), CacheScope::Guild, "9001".to_string())
        );
        assert!(a.sink.calls().is_empty());
    }

    #[tokio::test]
    async fn version_mismatch_closes_both_sides() {
        let a = TestNode::new("node-a");
        let b = TestNode::build("node-b", |config| {
            config.version = "99.0.0".into();
        });

        // The inbound side validates first and closes without answering;
        // the dialer sees the close.
        let (ta, tb) = link(&a, &b, "node-b");
        let rb = tb.await.unwrap();
        assert!(
            matches!(rb, Err(SyncError::IdentityMismatch { field: "version", .. })),
            "{rb:?}"
        );
        assert!(ta.await.unwrap().is_err());
        assert!(a.handler.state.lock().await.conns.is_empty());
        assert!(b.handler.state.lock().await.conns.is_empty());
    }

    #[tokio::test]
    async fn env_and_user_gates_are_independent() {
        let a = TestNode::new("node-a");
        let b = TestNode::build("node-b", |config| {
            config.env = RunEnv::Dev;
        });
        let (ta, tb) = link(&a, &b, "node-b");
        assert!(matches!(
            tb.await.unwrap(),
            Err(SyncError::IdentityMismatch { field: "env", .. })
        ));
        assert!(ta.await.unwrap().is_err());

        let c = TestNode::build("node-c", |config| {
            config.user_id = "other-bot".into();
        });
        let (ta, tc) = link(&a, &c, "node-c");
        assert!(matches!(
            tc.await.unwrap(),
            Err(SyncError::IdentityMismatch { field: "userId", .. })
        ));
        assert!(ta.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn self_loop_is_closed_by_the_receiving_side() {
        let a = TestNode::new("node-a");
        let other = TestNode::new("node-a");
        let (ta, tb) = link(&a, &other, "node-a");
        assert!(matches!(tb.await.unwrap(), Err(SyncError::SelfLoop)));
        assert!(ta.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn duplicate_ids_are_processed_once() {
        let b = TestNode::new("node-b");
        let frame = expire_frame("node-a", 5, "greeting", "42");

        b.handler.handle_frame(&frame, None).await.unwrap();
        b.handler.handle_frame(&frame, None).await.unwrap();
        // Lower id from the same source is also a duplicate.
        let stale = expire_frame("node-a", 4, "greeting", "42");
        b.handler.handle_frame(&stale, None).await.unwrap();

        assert_eq!(b.sink.calls().len(), 1);
    }

    #[tokio::test]
    async fn relay_excludes_the_origin_connection() {
        let b = TestNode::new("node-b");
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        {
            let mut state = b.handler.state.lock().await;
            state.conns.insert(1, ConnHandle { tx: tx1, peer: None });
            state.conns.insert(2, ConnHandle { tx: tx2, peer: None });
        }

        let heartbeat = frame("node-a", 42, Message::Heartbeat);
        b.handler.handle_frame(&heartbeat, Some(1)).await.unwrap();

        let relayed = rx2.try_recv().unwrap();
        assert_eq!(relayed, heartbeat);
        assert!(rx1.try_recv().is_err());

        // The copy arriving back over the other connection is dropped,
        // not re-relayed.
        b.handler.handle_frame(&heartbeat, Some(2)).await.unwrap();
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn own_frames_are_not_reprocessed() {
        let a = TestNode::new("node-a");
        let echoed = expire_frame("node-a", 3, "greeting", "42");
        a.handler.handle_frame(&echoed, None).await.unwrap();
        assert!(a.sink.calls().is_empty());
    }

    #[tokio::test]
    async fn only_heartbeat_and_instance_info_revive_a_dead_peer() {
        let b = TestNode::new("node-b");
        {
            let mut state = b.handler.state.lock().await;
            let peer = state.peers.get_or_insert("node-a");
            peer.known_dead = true;
            peer.last_message_id = 0;
        }

        let notice = expire_frame("node-a", 1, "greeting", "42");
        b.handler.handle_frame(&notice, None).await.unwrap();
        {
            let state = b.handler.state.lock().await;
            assert!(state.peers.get("node-a").unwrap().known_dead);
        }

        let heartbeat = frame("node-a", 2, Message::Heartbeat);
        b.handler.handle_frame(&heartbeat, None).await.unwrap();
        {
            let state = b.handler.state.lock().await;
            assert!(!state.peers.get("node-a").unwrap().known_dead);
        }
    }

    #[tokio::test]
    async fn lost_peer_marks_dead_and_resets_the_counter() {
        let b = TestNode::new("node-b");
        {
            let mut state = b.handler.state.lock().await;
            let peer = state.peers.get_or_insert("node-a");
            peer.last_seen = Some(Instant::now());
            peer.last_message_id = 30;
        }

        let notice = frame("node-c", 1, Message::LostPeer { name: "node-a".into() });
        b.handler.handle_frame(&notice, None).await.unwrap();

        let state = b.handler.state.lock().await;
        let peer = state.peers.get("node-a").unwrap();
        assert!(peer.known_dead);
        assert_eq!(peer.last_message_id, 0);
    }

    #[tokio::test]
    async fn lost_peer_for_unknown_name_is_ignored() {
        let b = TestNode::new("node-b");
        let notice = frame("node-c", 1, Message::LostPeer { name: "ghost".into() });
        let err = b.handler.handle_frame(&notice, None).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownPeer(_)));
    }
}
