//! The peer manager: owns the UDP sockets and the peer table, answers
//! offline traffic (pings and the cookie handshake), routes connected
//! datagrams to sessions, ticks every session's reliability layer, and
//! surfaces events on the application receive queue.

use crate::clock::Clock;
use crate::config::{Config, PROTOCOL_VERSION};
use crate::error::{NetError, Result};
use crate::event::Event;
use crate::protocol::offline::{OfflineMessage, MIN_MTU};
use crate::protocol::{Priority, Reliability};
use crate::session::Session;
use bytes::Bytes;
use dashmap::DashMap;
use garnet_binary::StringCodec;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Reliability tick cadence.
const TICK_INTERVAL: Duration = Duration::from_millis(10);
/// Handshake retry cadence and ceiling for outgoing connects.
const CONNECT_RETRY: Duration = Duration::from_millis(500);
const MAX_CONNECT_ATTEMPTS: u32 = 6;
/// Per-address floor between answered open requests.
const HANDSHAKE_RATE_LIMIT: Duration = Duration::from_millis(300);
/// Application receive queue depth.
const EVENT_QUEUE_DEPTH: usize = 4096;
/// Shrinking MTU probes for connect retries.
const PROBE_SIZES: [u16; 3] = [0, 1200, 576]; // 0 means "configured mtu"

/// Where a send goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Addr(SocketAddr),
    /// Every connected peer; per-peer reliability layers stay
    /// independent.
    Broadcast,
}

struct SessionEntry {
    session: Arc<Mutex<Session>>,
    socket: Arc<UdpSocket>,
}

struct PendingConnect {
    socket: Arc<UdpSocket>,
    password: Bytes,
    attempts: u32,
    last_attempt: Instant,
}

struct PeerInner {
    config: Config,
    guid: u64,
    cookie_seed: u64,
    clock: Clock,
    sockets: Vec<Arc<UdpSocket>>,
    sessions: DashMap<SocketAddr, SessionEntry>,
    pending: DashMap<SocketAddr, PendingConnect>,
    /// Last answered open request per address, for rate limiting.
    recent_opens: StdMutex<HashMap<SocketAddr, Instant>>,
    events_tx: mpsc::Sender<Event>,
    events_rx: Mutex<mpsc::Receiver<Event>>,
    draining: AtomicBool,
    string_codec: StringCodec,
}

/// A started garnet endpoint, client and server alike.
pub struct Peer {
    inner: Arc<PeerInner>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    /// Binds the given addresses, spawns the I/O and tick tasks, and
    /// marks the service live.
    pub async fn startup(config: Config, bind_addrs: &[SocketAddr]) -> Result<Self> {
        config
            .validate()
            .map_err(|e| NetError::InvalidParameter(e.to_string()))?;
        if bind_addrs.is_empty() {
            return Err(NetError::InvalidParameter(
                "at least one bind address required".into(),
            ));
        }

        let mut sockets = Vec::with_capacity(bind_addrs.len());
        for addr in bind_addrs {
            let socket = UdpSocket::bind(addr).await?;
            info!(bound = %socket.local_addr()?, "socket ready");
            sockets.push(Arc::new(socket));
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let guid: u64 = rand::random();
        let inner = Arc::new(PeerInner {
            config,
            guid,
            cookie_seed: rand::random(),
            clock: Clock::new(),
            sockets,
            sessions: DashMap::new(),
            pending: DashMap::new(),
            recent_opens: StdMutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(events_rx),
            draining: AtomicBool::new(false),
            string_codec: StringCodec::new(),
        });
        info!(guid, "peer started");

        let mut tasks = Vec::new();
        for socket in &inner.sockets {
            let inner = Arc::clone(&inner);
            let socket = Arc::clone(socket);
            tasks.push(tokio::spawn(async move {
                recv_loop(inner, socket).await;
            }));
        }
        {
            let inner = Arc::clone(&inner);
            tasks.push(tokio::spawn(async move {
                tick_loop(inner).await;
            }));
        }

        Ok(Self {
            inner,
            tasks: StdMutex::new(tasks),
        })
    }

    /// This peer's 64-bit identity token.
    pub fn guid(&self) -> u64 {
        self.inner.guid
    }

    /// The local address of the first bound socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.sockets[0].local_addr()?)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// The string codec context shared by this endpoint's users.
    pub fn string_codec(&self) -> &StringCodec {
        &self.inner.string_codec
    }

    /// Starts an outgoing handshake. Progress is reported through the
    /// event queue: `ConnectionRequestAccepted` on success, one of the
    /// rejection events otherwise.
    pub async fn connect(&self, host: &str, port: u16, password: Option<&[u8]>) -> Result<()> {
        if self.inner.draining.load(Ordering::Relaxed) {
            return Err(NetError::Shutdown);
        }
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| NetError::InvalidParameter(format!("cannot resolve {host}:{port}")))?;
        if self.inner.sessions.contains_key(&addr) || self.inner.pending.contains_key(&addr) {
            return Err(NetError::InvalidParameter(format!(
                "connection to {addr} already open or in progress"
            )));
        }
        let socket = Arc::clone(&self.inner.sockets[0]);
        let now = self.inner.clock.now();
        self.inner.pending.insert(
            addr,
            PendingConnect {
                socket: Arc::clone(&socket),
                password: Bytes::copy_from_slice(password.unwrap_or_default()),
                attempts: 0,
                last_attempt: now,
            },
        );
        debug!(%addr, "connect requested");
        self.inner
            .send_open_request(&socket, addr, self.inner.config.mtu)
            .await;
        Ok(())
    }

    /// Routes one application message, or broadcasts it.
    pub async fn send(
        &self,
        payload: Bytes,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
        target: Target,
        receipt: Option<u32>,
    ) -> Result<()> {
        if self.inner.draining.load(Ordering::Relaxed) {
            return Err(NetError::Shutdown);
        }
        match target {
            Target::Addr(addr) => {
                self.inner
                    .send_to_session(addr, payload, priority, reliability, channel, receipt)
                    .await
            }
            Target::Broadcast => {
                let addrs: Vec<SocketAddr> =
                    self.inner.sessions.iter().map(|e| *e.key()).collect();
                for addr in addrs {
                    // Handshaking sessions simply refuse; that is fine
                    // for a broadcast.
                    if let Err(e) = self
                        .inner
                        .send_to_session(
                            addr,
                            payload.clone(),
                            priority,
                            reliability,
                            channel,
                            receipt,
                        )
                        .await
                    {
                        trace!(%addr, error = %e, "broadcast skip");
                    }
                }
                Ok(())
            }
        }
    }

    /// Non-blocking pop of the next application-visible event.
    pub fn receive(&self) -> Option<Event> {
        self.inner.events_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Awaits the next application-visible event.
    pub async fn recv(&self) -> Option<Event> {
        self.inner.events_rx.lock().await.recv().await
    }

    /// Sends an unconnected ping; any reply surfaces as
    /// [`Event::AdvertiseSystem`].
    pub async fn ping(&self, addr: SocketAddr) -> Result<()> {
        let message = OfflineMessage::UnconnectedPing {
            time: self.inner.clock.micros(),
            client_guid: self.inner.guid,
        };
        self.inner
            .send_offline(&self.inner.sockets[0], addr, &message)
            .await;
        Ok(())
    }

    /// Schedules teardown of one connection: graceful (notify + drain)
    /// or immediate.
    pub async fn close_connection(&self, addr: SocketAddr, notify: bool) -> Result<()> {
        let entry = self
            .inner
            .sessions
            .get(&addr)
            .map(|e| Arc::clone(&e.session))
            .ok_or(NetError::SessionNotFound(addr))?;
        let mut session = entry.lock().await;
        session.close(notify, self.inner.clock.now());
        drop(session);
        self.inner.pump_session(addr).await;
        Ok(())
    }

    /// Refuses new work, drains reliably for up to `duration`, then
    /// tears everything down.
    pub async fn shutdown(&self, duration: Duration) {
        info!("shutdown requested");
        self.inner.draining.store(true, Ordering::Relaxed);

        let addrs: Vec<SocketAddr> = self.inner.sessions.iter().map(|e| *e.key()).collect();
        let now = self.inner.clock.now();
        for addr in &addrs {
            if let Some(entry) = self
                .inner
                .sessions
                .get(addr)
                .map(|e| Arc::clone(&e.session))
            {
                entry.lock().await.close(true, now);
            }
        }

        // The tick task keeps draining; wait for it or the deadline.
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.inner.sessions.is_empty() {
                break;
            }
            tokio::time::sleep(TICK_INTERVAL).await;
        }

        let leftover: Vec<Arc<Mutex<Session>>> = self
            .inner
            .sessions
            .iter()
            .map(|e| Arc::clone(&e.session))
            .collect();
        for session in leftover {
            session.lock().await.close(false, self.inner.clock.now());
        }
        self.inner.sessions.clear();
        self.inner.pending.clear();

        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("peer stopped");
    }
}

impl PeerInner {
    fn cookie_for(&self, addr: SocketAddr) -> u32 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.cookie_seed.hash(&mut hasher);
        addr.hash(&mut hasher);
        hasher.finish() as u32
    }

    fn push_event(&self, event: Event) {
        if self.events_tx.try_send(event).is_err() {
            warn!("receive queue full, event dropped");
        }
    }

    async fn send_offline(&self, socket: &UdpSocket, addr: SocketAddr, message: &OfflineMessage) {
        match message.encode() {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, addr).await {
                    warn!(%addr, error = %e, "offline send failed");
                }
            }
            Err(e) => warn!(%addr, error = %e, "offline encode failed"),
        }
    }

    async fn send_open_request(&self, socket: &UdpSocket, addr: SocketAddr, mtu_probe: u16) {
        let message = OfflineMessage::OpenRequest {
            protocol_version: PROTOCOL_VERSION,
            mtu_probe,
        };
        self.send_offline(socket, addr, &message).await;
    }

    async fn send_to_session(
        &self,
        addr: SocketAddr,
        payload: Bytes,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
        receipt: Option<u32>,
    ) -> Result<()> {
        let session = self
            .sessions
            .get(&addr)
            .map(|e| Arc::clone(&e.session))
            .ok_or(NetError::SessionNotFound(addr))?;
        let now = self.clock.now();
        session
            .lock()
            .await
            .send(payload, priority, reliability, channel, receipt, now)?;
        if priority == Priority::Immediate {
            self.pump_session(addr).await;
        }
        Ok(())
    }

    /// Runs one update for a session and flushes its datagrams and
    /// events right away.
    async fn pump_session(&self, addr: SocketAddr) {
        let Some((session, socket)) = self
            .sessions
            .get(&addr)
            .map(|e| (Arc::clone(&e.session), Arc::clone(&e.socket)))
        else {
            return;
        };
        let now = self.clock.now();
        let micros = self.clock.micros();
        let mut guard = session.lock().await;
        let wire = guard.update(now, micros);
        let mut events = Vec::new();
        while let Some(event) = guard.poll_event() {
            events.push(event);
        }
        drop(guard);
        for datagram in wire {
            if let Err(e) = socket.send_to(&datagram, addr).await {
                warn!(%addr, error = %e, "socket send failed");
            }
        }
        for event in events {
            self.push_event(event);
        }
    }

    async fn handle_datagram(self: &Arc<Self>, bytes: Bytes, addr: SocketAddr, socket: &Arc<UdpSocket>) {
        if bytes.is_empty() {
            return;
        }

        let existing = self
            .sessions
            .get(&addr)
            .map(|e| (Arc::clone(&e.session), Arc::clone(&e.socket)));
        if let Some((session, _)) = existing {
            let now = self.clock.now();
            let micros = self.clock.micros();
            session.lock().await.handle_datagram(bytes, now, micros);
            // Flush anything the datagram provoked (ACKs, replies).
            self.pump_session(addr).await;
            return;
        }

        match OfflineMessage::decode(&bytes) {
            Ok(Some(message)) => self.handle_offline(message, addr, socket).await,
            Ok(None) => {
                trace!(%addr, "connected-format datagram from unknown address dropped");
            }
            Err(e) => {
                trace!(%addr, error = %e, "undecodable offline datagram dropped");
            }
        }
    }

    async fn handle_offline(
        self: &Arc<Self>,
        message: OfflineMessage,
        addr: SocketAddr,
        socket: &Arc<UdpSocket>,
    ) {
        match message {
            OfflineMessage::UnconnectedPing { time, .. } => {
                let pong = OfflineMessage::UnconnectedPong {
                    time,
                    server_guid: self.guid,
                    advertisement: Bytes::copy_from_slice(self.config.advertisement.as_bytes()),
                };
                self.send_offline(socket, addr, &pong).await;
            }
            OfflineMessage::UnconnectedPong {
                server_guid,
                advertisement,
                ..
            } => {
                self.push_event(Event::AdvertiseSystem {
                    addr,
                    guid: server_guid,
                    payload: advertisement,
                });
            }
            OfflineMessage::OpenRequest {
                protocol_version,
                mtu_probe,
            } => {
                self.handle_open_request(addr, socket, protocol_version, mtu_probe)
                    .await;
            }
            OfflineMessage::OpenChallenge {
                server_guid,
                cookie,
                mtu,
            } => {
                self.handle_open_challenge(addr, socket, server_guid, cookie, mtu)
                    .await;
            }
            OfflineMessage::OpenResponse {
                cookie,
                client_guid,
                mtu,
                password,
            } => {
                self.handle_open_response(addr, socket, cookie, client_guid, mtu, password)
                    .await;
            }
            OfflineMessage::IncompatibleProtocol { server_version, .. } => {
                if self.pending.remove(&addr).is_some() {
                    warn!(%addr, server_version, "protocol version mismatch");
                    self.push_event(Event::ConnectionAttemptFailed { addr });
                }
            }
            OfflineMessage::AlreadyConnected { .. } => {
                if self.pending.remove(&addr).is_some() {
                    self.push_event(Event::AlreadyConnected { addr });
                }
            }
            OfflineMessage::NoFreeIncomingConnections { .. } => {
                if self.pending.remove(&addr).is_some() {
                    self.push_event(Event::NoFreeIncomingConnections { addr });
                }
            }
            OfflineMessage::InvalidPassword { .. } => {
                if self.pending.remove(&addr).is_some() {
                    self.push_event(Event::InvalidPassword { addr });
                }
            }
        }
    }

    async fn handle_open_request(
        self: &Arc<Self>,
        addr: SocketAddr,
        socket: &Arc<UdpSocket>,
        protocol_version: u8,
        mtu_probe: u16,
    ) {
        if self.draining.load(Ordering::Relaxed) {
            return;
        }
        // Per-address rate limit: a cookie reply costs nothing to forge
        // requests for, so do not answer faster than this.
        {
            let mut recent = match self.recent_opens.lock() {
                Ok(recent) => recent,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            if let Some(last) = recent.get(&addr) {
                if now.duration_since(*last) < HANDSHAKE_RATE_LIMIT {
                    trace!(%addr, "open request rate limited");
                    return;
                }
            }
            recent.insert(addr, now);
        }

        if protocol_version != PROTOCOL_VERSION {
            let reply = OfflineMessage::IncompatibleProtocol {
                server_version: PROTOCOL_VERSION,
                server_guid: self.guid,
            };
            self.send_offline(socket, addr, &reply).await;
            return;
        }
        if self.sessions.contains_key(&addr) {
            let reply = OfflineMessage::AlreadyConnected {
                server_guid: self.guid,
            };
            self.send_offline(socket, addr, &reply).await;
            return;
        }
        if self.sessions.len() >= self.config.max_connections {
            let reply = OfflineMessage::NoFreeIncomingConnections {
                server_guid: self.guid,
            };
            self.send_offline(socket, addr, &reply).await;
            return;
        }

        let mtu = mtu_probe.min(self.config.mtu).max(MIN_MTU);
        let reply = OfflineMessage::OpenChallenge {
            server_guid: self.guid,
            cookie: self.cookie_for(addr),
            mtu,
        };
        self.send_offline(socket, addr, &reply).await;
    }

    async fn handle_open_challenge(
        self: &Arc<Self>,
        addr: SocketAddr,
        socket: &Arc<UdpSocket>,
        server_guid: u64,
        cookie: u32,
        mtu: u16,
    ) {
        let Some((_, pending)) = self.pending.remove(&addr) else {
            trace!(%addr, "unsolicited open challenge dropped");
            return;
        };
        let mtu = mtu.min(self.config.mtu).max(MIN_MTU);
        let response = OfflineMessage::OpenResponse {
            cookie,
            client_guid: self.guid,
            mtu,
            password: pending.password.clone(),
        };
        self.send_offline(socket, addr, &response).await;

        let session = Session::new_client(addr, server_guid, mtu, &self.config, self.clock.now());
        self.sessions.insert(
            addr,
            SessionEntry {
                session: Arc::new(Mutex::new(session)),
                socket: Arc::clone(socket),
            },
        );
        debug!(%addr, mtu, "open response sent, session handshaking");
    }

    async fn handle_open_response(
        self: &Arc<Self>,
        addr: SocketAddr,
        socket: &Arc<UdpSocket>,
        cookie: u32,
        client_guid: u64,
        mtu: u16,
        password: Bytes,
    ) {
        if cookie != self.cookie_for(addr) {
            trace!(%addr, "bad cookie in open response");
            return;
        }
        if self.sessions.contains_key(&addr) {
            // Response retransmitted after the session came up; the
            // session-level handshake already covers it.
            return;
        }
        if self.sessions.len() >= self.config.max_connections {
            let reply = OfflineMessage::NoFreeIncomingConnections {
                server_guid: self.guid,
            };
            self.send_offline(socket, addr, &reply).await;
            return;
        }
        let expected = self.config.password.as_deref().unwrap_or_default();
        if expected.as_bytes() != password.as_ref() {
            warn!(%addr, "invalid password in open response");
            let reply = OfflineMessage::InvalidPassword {
                server_guid: self.guid,
            };
            self.send_offline(socket, addr, &reply).await;
            return;
        }

        let mtu = mtu.min(self.config.mtu).max(MIN_MTU);
        let session = Session::new_server(
            addr,
            client_guid,
            self.guid,
            mtu,
            &self.config,
            self.clock.now(),
        );
        self.sessions.insert(
            addr,
            SessionEntry {
                session: Arc::new(Mutex::new(session)),
                socket: Arc::clone(socket),
            },
        );
        // Push the accepted message out without waiting a tick.
        self.pump_session(addr).await;
    }

    /// One pass of the periodic driver.
    async fn tick(self: &Arc<Self>) {
        let now = self.clock.now();

        // Outgoing handshake retries, with shrinking MTU probes.
        let pending_addrs: Vec<SocketAddr> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = Vec::new();
        for addr in pending_addrs {
            let mut retry: Option<(Arc<UdpSocket>, u16)> = None;
            if let Some(mut entry) = self.pending.get_mut(&addr) {
                if now.duration_since(entry.last_attempt) < CONNECT_RETRY {
                    continue;
                }
                entry.attempts += 1;
                if entry.attempts >= MAX_CONNECT_ATTEMPTS {
                    failed.push(addr);
                    continue;
                }
                entry.last_attempt = now;
                let probe = PROBE_SIZES[(entry.attempts as usize / 2).min(PROBE_SIZES.len() - 1)];
                let probe = if probe == 0 { self.config.mtu } else { probe };
                retry = Some((Arc::clone(&entry.socket), probe));
            }
            if let Some((socket, probe)) = retry {
                self.send_open_request(&socket, addr, probe).await;
            }
        }
        for addr in failed {
            self.pending.remove(&addr);
            warn!(%addr, "connection attempt failed");
            self.push_event(Event::ConnectionAttemptFailed { addr });
        }

        // Drive every session; collect the dead for removal.
        let addrs: Vec<SocketAddr> = self.sessions.iter().map(|e| *e.key()).collect();
        for addr in addrs {
            self.pump_session(addr).await;
            let dead = match self.sessions.get(&addr) {
                Some(entry) => {
                    let session = Arc::clone(&entry.session);
                    drop(entry);
                    session.lock().await.is_dead()
                }
                None => false,
            };
            if dead {
                debug!(%addr, "removing dead session");
                self.sessions.remove(&addr);
            }
        }

        // Keep the handshake rate-limit map from growing unboundedly.
        let mut recent = match self.recent_opens.lock() {
            Ok(recent) => recent,
            Err(poisoned) => poisoned.into_inner(),
        };
        recent.retain(|_, last| now.duration_since(*last) < Duration::from_secs(10));
    }
}

async fn recv_loop(inner: Arc<PeerInner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 2048];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, addr)) => {
                let bytes = Bytes::copy_from_slice(&buf[..len]);
                inner.handle_datagram(bytes, addr, &socket).await;
            }
            Err(e) => {
                // UDP receive errors are usually transient (e.g. ICMP
                // port unreachable surfaced on some platforms).
                error!(error = %e, "socket receive failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn tick_loop(inner: Arc<PeerInner>) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    loop {
        interval.tick().await;
        inner.tick().await;
    }
}
