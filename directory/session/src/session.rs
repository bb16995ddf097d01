//! The session engine: correlation, session lifecycle, and keepalive.
//!
//! One engine instance owns one logical directory session across any
//! number of transport-level connections. A background connection loop
//! dials servers, runs the session-establish handshake, and keeps the
//! session alive with pings; the engine itself is the transport's
//! [`ResponseSink`], routing every inbound reply either to the pending
//! table or to one of the reserved-id handlers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use directory_wire::{
    AuthInfo, ConnectReply, ConnectRequest, OpCode, ReplyHeader, RequestHeader, SessionNotice,
    WatchKind, WatchPush, AUTH_XID, HANDSHAKE_XID, NOTIFICATION_XID, PING_XID, PROTOCOL_VERSION,
    SERVER_XID,
};
use directory_wire::NoticeKind;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::{EngineConfig, MAX_SESSION_TIMEOUT, MIN_SESSION_TIMEOUT};
use crate::dispatcher::{
    DispatchEvent, EventDispatcher, LifecycleEvent, LifecycleListener, SessionEventKind,
};
use crate::error::EngineError;
use crate::packet::{Packet, ReplyFuture, RequestCallback, Settlement};
use crate::pending::PendingQueue;
use crate::transport::{ResponseSink, Transport};
use crate::watchers::{WatchListener, WatchRegistration, WatcherRegistry};

/// Connection status of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection attempt has succeeded yet
    New,
    /// Previously connected, currently between connections
    NotConnected,
    /// Connected with an established session
    Connected,
    /// Credentials were rejected; reconnection is parked until new
    /// credentials arrive
    AuthFailed,
    /// Explicitly closed; the engine will not reconnect
    Closed,
}

impl ConnectionStatus {
    /// Whether the engine may still (re)connect; false only once closed
    pub fn is_alive(self) -> bool {
        !matches!(self, ConnectionStatus::Closed)
    }

    /// Whether requests can be submitted right now
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Session identity carried across reconnects
#[derive(Debug, Clone, Default)]
struct SessionIdentity {
    id: String,
    password: Bytes,
    server_id: i32,
    timeout: Duration,
}

/// Client-side session engine for the directory protocol.
///
/// Create one with [`SessionEngine::start`]; it stays usable until
/// [`SessionEngine::close`], reconnecting and resuming the session
/// through transient outages on its own.
pub struct SessionEngine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    pending: PendingQueue,
    registry: Arc<WatcherRegistry>,
    dispatcher: EventDispatcher,
    /// Correlation ids for regular requests, seeded at 1 so the reserved
    /// ids (0 and negatives) never collide
    xid: AtomicI64,
    /// Highest remote transaction marker observed, echoed in handshakes
    last_dxid: AtomicI64,
    status: Mutex<ConnectionStatus>,
    session: Mutex<SessionIdentity>,
    auth: Mutex<Option<AuthInfo>>,
    /// Settlement cell of the in-flight handshake, if any
    handshake: Mutex<Option<Arc<Settlement>>>,
    last_send: Mutex<Instant>,
    last_recv: Mutex<Instant>,
    closing: AtomicBool,
    /// Wakes the connection loop out of its steady state
    reopen: Notify,
    /// Latched reopen request, so one fired while the loop is between
    /// waits is still honored
    reopen_requested: AtomicBool,
}

impl SessionEngine {
    /// Start an engine against the given server list.
    ///
    /// The connection loop runs on a background task until the engine is
    /// closed. Addresses are tried round-robin.
    pub fn start(
        addrs: Vec<SocketAddr>,
        config: EngineConfig,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Arc<Self>> {
        anyhow::ensure!(!addrs.is_empty(), "at least one server address is required");

        let registry = Arc::new(WatcherRegistry::new());
        let engine = Arc::new(Self {
            dispatcher: EventDispatcher::start(Arc::clone(&registry)),
            registry,
            config,
            transport,
            pending: PendingQueue::new(),
            xid: AtomicI64::new(1),
            last_dxid: AtomicI64::new(0),
            status: Mutex::new(ConnectionStatus::New),
            session: Mutex::new(SessionIdentity::default()),
            auth: Mutex::new(None),
            handshake: Mutex::new(None),
            last_send: Mutex::new(Instant::now()),
            last_recv: Mutex::new(Instant::now()),
            closing: AtomicBool::new(false),
            reopen: Notify::new(),
            reopen_requested: AtomicBool::new(false),
        });

        tokio::spawn(Arc::clone(&engine).run(addrs));
        Ok(engine)
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    /// Id of the established session, if one exists
    pub fn session_id(&self) -> Option<String> {
        let session = self.session.lock().expect("session lock poisoned");
        if session.id.is_empty() {
            None
        } else {
            Some(session.id.clone())
        }
    }

    /// Register a listener for status and session lifecycle events
    pub fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.dispatcher.add_lifecycle_listener(listener);
    }

    /// Submit a request and wait for its reply.
    pub async fn submit(&self, op: OpCode, payload: Bytes) -> Result<Bytes, EngineError> {
        self.submit_future(op, payload).get().await
    }

    /// Submit a request and return a handle to its eventual reply.
    pub fn submit_future(&self, op: OpCode, payload: Bytes) -> ReplyFuture {
        let packet = Packet::new(RequestHeader::new(op), payload);
        let future = ReplyFuture::new(packet.cell.clone());
        self.queue_packet(packet);
        future
    }

    /// Submit a request whose outcome is delivered to `callback` from the
    /// event dispatcher, exactly once, in completion order.
    pub fn submit_callback(
        &self,
        op: OpCode,
        payload: Bytes,
        callback: Arc<dyn RequestCallback>,
        context: Option<Bytes>,
    ) {
        let mut packet = Packet::new(RequestHeader::new(op), payload);
        packet.callback = Some((callback, context));
        self.queue_packet(packet);
    }

    /// Subscribe to changes on `subject` and wait for the subscription
    /// request to complete.
    ///
    /// The listener only becomes active once the server acknowledges the
    /// subscription; events may start arriving shortly after this
    /// returns, never before.
    pub async fn watch(
        &self,
        subject: &str,
        kind: WatchKind,
        listener: Arc<dyn WatchListener>,
    ) -> Result<Bytes, EngineError> {
        let op = match kind {
            WatchKind::Service => OpCode::WatchService,
            WatchKind::Metadata => OpCode::WatchMetadata,
        };
        let mut packet = Packet::new(
            RequestHeader::new(op),
            Bytes::copy_from_slice(subject.as_bytes()),
        );
        packet.watch = Some(WatchRegistration {
            subject: subject.to_string(),
            kind,
            listener,
        });
        let future = ReplyFuture::new(packet.cell.clone());
        self.queue_packet(packet);
        future.get().await
    }

    /// Drop a previously registered watch listener. Local only; the
    /// server keeps pushing events for the subject while other listeners
    /// remain.
    pub fn remove_watch(&self, subject: &str, kind: WatchKind, listener: &Arc<dyn WatchListener>) {
        self.registry.unregister(subject, kind, listener);
    }

    /// Attach directory credentials to the session.
    ///
    /// The credentials ride along in every future handshake. When a
    /// connection is up they are also submitted immediately; a rejection
    /// moves the engine to [`ConnectionStatus::AuthFailed`], which only
    /// another `set_auth` call can exit.
    pub fn set_auth(&self, scheme: &str, principal: &str, secret: Bytes, obfuscated: bool) {
        let info = AuthInfo {
            scheme: scheme.to_string(),
            principal: principal.to_string(),
            secret,
            obfuscated,
        };

        let mut buf = BytesMut::new();
        info.encode(&mut buf);
        *self.auth.lock().expect("auth lock poisoned") = Some(info);

        if self.status() == ConnectionStatus::AuthFailed {
            info!("new credentials supplied, resuming reconnect attempts");
            self.set_status(ConnectionStatus::NotConnected);
            self.reopen.notify_waiters();
            return;
        }

        if self.status().is_connected() {
            let header = RequestHeader {
                xid: AUTH_XID,
                ..RequestHeader::new(OpCode::Auth)
            };
            if self.transport.send(header, &buf.freeze()).is_err() {
                debug!("auth submit deferred to next handshake");
            } else {
                self.touch_send();
            }
        }
    }

    /// Close the engine.
    ///
    /// Sends a best-effort close request, force-completes every pending
    /// request with [`EngineError::ClientClosed`], discards the session
    /// identity and all watches, and drains the event dispatcher. The
    /// engine never reconnects afterwards; idempotent.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing session engine");

        if self.transport.is_connected() {
            let mut header = RequestHeader::new(OpCode::CloseSession);
            header.xid = self.xid.fetch_add(1, Ordering::SeqCst);
            if self.transport.send(header, &Bytes::new()).is_err() {
                debug!("close request not sent, connection already gone");
            }
        }

        self.set_status(ConnectionStatus::Closed);
        for packet in self.pending.drain_all(EngineError::ClientClosed) {
            self.dispatcher.emit(DispatchEvent::Finished(packet));
        }
        self.clear_identity();
        self.reopen.notify_waiters();
        self.transport.cleanup();
        self.dispatcher.shutdown().await;
    }

    // ---- submission path -------------------------------------------------

    /// Assign a correlation id, append to the pending table, and hand the
    /// frame to the transport, all inside the table's critical section so
    /// send order always equals table order. Requests that cannot be sent
    /// are force-completed instead of queued.
    fn queue_packet(&self, mut packet: Packet) {
        let status = if self.closing.load(Ordering::SeqCst) {
            ConnectionStatus::Closed
        } else {
            self.status()
        };
        if !status.is_connected() {
            packet.settle_err(EngineError::from_status(status));
            self.dispatcher.emit(DispatchEvent::Finished(packet));
            return;
        }

        let sent = self.pending.with_locked(|queue| {
            packet.header.xid = self.xid.fetch_add(1, Ordering::SeqCst);
            match self.transport.send(packet.header, &packet.payload) {
                Ok(()) => {
                    queue.push_back(packet);
                    true
                }
                Err(_) => {
                    packet.settle_err(EngineError::ConnectionLoss);
                    self.dispatcher.emit(DispatchEvent::Finished(packet));
                    false
                }
            }
        });
        if sent {
            self.touch_send();
        }
    }

    // ---- connection loop -------------------------------------------------

    async fn run(self: Arc<Self>, addrs: Vec<SocketAddr>) {
        let mut attempt = 0usize;
        while self.status().is_alive() && !self.closing.load(Ordering::SeqCst) {
            if self.status() == ConnectionStatus::AuthFailed {
                // Parked until set_auth supplies new credentials.
                tokio::time::sleep(self.config.reconnect_backoff).await;
                continue;
            }
            let addr = addrs[attempt % addrs.len()];
            attempt += 1;

            let sink: Arc<dyn ResponseSink> = Arc::clone(&self) as Arc<dyn ResponseSink>;
            let connected = tokio::time::timeout(
                self.config.connect_timeout,
                self.transport.connect(addr, sink),
            )
            .await;
            match connected {
                Err(_) => {
                    warn!(%addr, "connect attempt timed out");
                    self.transport.cleanup();
                    self.backoff().await;
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(%addr, "connect failed: {e:#}");
                    self.backoff().await;
                    continue;
                }
                Ok(Ok(false)) => {
                    self.backoff().await;
                    continue;
                }
                Ok(Ok(true)) => {}
            }

            match self.establish_session().await {
                Ok(event) => {
                    self.set_status(ConnectionStatus::Connected);
                    self.dispatcher
                        .emit(DispatchEvent::Lifecycle(LifecycleEvent::Session(event)));
                }
                Err(EngineError::SessionExpired) => {
                    // Identity already discarded; retry as a fresh session
                    // without waiting out the backoff.
                    self.transport.cleanup();
                    continue;
                }
                Err(EngineError::AuthFailed) => {
                    self.transport.cleanup();
                    self.fail_auth();
                    continue;
                }
                Err(e) => {
                    warn!(%addr, "handshake failed: {e}");
                    self.transport.cleanup();
                    self.backoff().await;
                    continue;
                }
            }

            self.steady_state().await;

            self.transport.cleanup();
            if self.status() == ConnectionStatus::Connected {
                self.set_status(ConnectionStatus::NotConnected);
            }
            for packet in self.pending.drain_all(EngineError::ConnectionLoss) {
                self.dispatcher.emit(DispatchEvent::Finished(packet));
            }
            self.backoff().await;
        }

        self.transport.cleanup();
        debug!("connection loop stopped");
    }

    async fn backoff(&self) {
        if !self.closing.load(Ordering::SeqCst) {
            tokio::time::sleep(self.config.reconnect_backoff).await;
        }
    }

    /// Run the session-establish handshake on the current connection.
    ///
    /// Resumes the previous session when an identity exists, otherwise
    /// asks for a new one. The reply bypasses the pending table and is
    /// routed here through the handshake settlement cell.
    async fn establish_session(&self) -> Result<SessionEventKind, EngineError> {
        let cell = Settlement::new();
        *self.handshake.lock().expect("handshake lock poisoned") = Some(cell.clone());

        let (request, resuming) = {
            let session = self.session.lock().expect("session lock poisoned");
            let auth = self.auth.lock().expect("auth lock poisoned").clone();
            let request = ConnectRequest {
                protocol_version: PROTOCOL_VERSION,
                last_dxid_seen: self.last_dxid.load(Ordering::SeqCst),
                timeout_ms: self.config.clamped_session_timeout().as_millis() as u32,
                session_id: session.id.clone(),
                password: session.password.clone(),
                auth,
            };
            (request, !session.id.is_empty())
        };

        let header = RequestHeader {
            xid: HANDSHAKE_XID,
            ..RequestHeader::new(OpCode::Connect)
        };
        self.transport
            .send(header, &request.encode())
            .map_err(|_| EngineError::ConnectionLoss)?;
        self.touch_send();

        let payload = match cell.wait_timeout(self.config.connect_timeout).await {
            Ok(payload) => payload,
            Err(EngineError::WaitTimeout) => return Err(EngineError::ConnectTimeout),
            Err(EngineError::SessionExpired) => {
                self.expire_session();
                return Err(EngineError::SessionExpired);
            }
            Err(e) => return Err(e),
        };

        let mut body = payload;
        let reply = ConnectReply::decode(&mut body).map_err(|e| {
            warn!("undecodable handshake reply: {e}");
            EngineError::ConnectionLoss
        })?;

        let negotiated = Duration::from_millis(u64::from(reply.timeout_ms))
            .clamp(MIN_SESSION_TIMEOUT, MAX_SESSION_TIMEOUT);
        {
            let mut session = self.session.lock().expect("session lock poisoned");
            session.id = reply.session_id.clone();
            session.password = reply.password;
            session.server_id = reply.server_id;
            session.timeout = negotiated;
        }

        info!(
            session_id = %reply.session_id,
            server_id = reply.server_id,
            timeout_ms = negotiated.as_millis() as u64,
            resumed = resuming,
            "session established"
        );
        Ok(if resuming {
            SessionEventKind::Reopened
        } else {
            SessionEventKind::Created
        })
    }

    /// Keepalive loop: ping at half the negotiated timeout, reopen the
    /// connection when nothing has been received for a full timeout.
    async fn steady_state(&self) {
        loop {
            if self.closing.load(Ordering::SeqCst) || !self.status().is_connected() {
                return;
            }
            if self.reopen_requested.swap(false, Ordering::SeqCst) {
                return;
            }

            let interval = self.negotiated_timeout() / 2;
            let ping_at = *self.last_send.lock().expect("clock lock poisoned") + interval;
            tokio::select! {
                _ = self.reopen.notified() => {
                    self.reopen_requested.store(false, Ordering::SeqCst);
                    return;
                }
                _ = tokio::time::sleep_until(ping_at) => {}
            }

            let idle = self
                .last_recv
                .lock()
                .expect("clock lock poisoned")
                .elapsed();
            if idle > self.negotiated_timeout() {
                warn!(
                    idle_ms = idle.as_millis() as u64,
                    "no server traffic within the session timeout, reopening"
                );
                return;
            }

            let since_send = self
                .last_send
                .lock()
                .expect("clock lock poisoned")
                .elapsed();
            if since_send >= interval {
                let header = RequestHeader {
                    xid: PING_XID,
                    ..RequestHeader::new(OpCode::Ping)
                };
                if self.transport.send(header, &Bytes::new()).is_err() {
                    return;
                }
                trace!("keepalive ping sent");
                self.touch_send();
            }
        }
    }

    fn negotiated_timeout(&self) -> Duration {
        let timeout = self.session.lock().expect("session lock poisoned").timeout;
        if timeout.is_zero() {
            self.config.clamped_session_timeout()
        } else {
            timeout
        }
    }

    // ---- state transitions -----------------------------------------------

    fn set_status(&self, next: ConnectionStatus) {
        let previous = {
            let mut status = self.status.lock().expect("status lock poisoned");
            let previous = *status;
            if previous == next || previous == ConnectionStatus::Closed {
                return;
            }
            *status = next;
            previous
        };
        debug!(?previous, current = ?next, "connection status changed");
        self.dispatcher
            .emit(DispatchEvent::Lifecycle(LifecycleEvent::StatusChanged {
                previous,
                current: next,
            }));
    }

    /// Discard the session identity and all watches. Emits one session
    /// Closed event when an identity actually existed.
    fn clear_identity(&self) {
        let existed = {
            let mut session = self.session.lock().expect("session lock poisoned");
            let existed = !session.id.is_empty();
            *session = SessionIdentity::default();
            existed
        };
        self.registry.clear_all();
        if existed {
            self.dispatcher
                .emit(DispatchEvent::Lifecycle(LifecycleEvent::Session(
                    SessionEventKind::Closed,
                )));
        }
    }

    /// The server declared the session dead: everything pending fails,
    /// the identity is discarded, and the loop reconnects fresh.
    fn expire_session(&self) {
        warn!("session expired by the server");
        for packet in self.pending.drain_all(EngineError::SessionExpired) {
            self.dispatcher.emit(DispatchEvent::Finished(packet));
        }
        self.clear_identity();
        self.set_status(ConnectionStatus::NotConnected);
        self.request_reopen();
    }

    /// Credentials rejected: nothing pending survives and reconnection is
    /// parked, but the session identity stays so new credentials can
    /// still resume it.
    fn fail_auth(&self) {
        error!("directory rejected the session credentials");
        self.set_status(ConnectionStatus::AuthFailed);
        for packet in self.pending.drain_all(EngineError::AuthFailed) {
            self.dispatcher.emit(DispatchEvent::Finished(packet));
        }
        self.request_reopen();
    }

    /// Ask the connection loop to drop the current connection. The flag
    /// latches the request for a loop that is between waits.
    fn request_reopen(&self) {
        self.reopen_requested.store(true, Ordering::SeqCst);
        self.reopen.notify_waiters();
    }

    fn touch_send(&self) {
        *self.last_send.lock().expect("clock lock poisoned") = Instant::now();
    }

    fn touch_recv(&self) {
        *self.last_recv.lock().expect("clock lock poisoned") = Instant::now();
    }
}

impl ResponseSink for SessionEngine {
    /// Single entry point for every inbound reply. Reserved correlation
    /// ids route to their handlers; everything else goes through the
    /// pending table.
    fn on_response(&self, header: ReplyHeader, payload: Bytes) {
        self.touch_recv();
        if header.dxid > 0 {
            self.last_dxid.fetch_max(header.dxid, Ordering::SeqCst);
        }

        match header.xid {
            HANDSHAKE_XID => {
                let cell = self.handshake.lock().expect("handshake lock poisoned").take();
                match cell {
                    Some(cell) if header.err.is_ok() => {
                        cell.complete(payload);
                    }
                    Some(cell) => {
                        cell.fail(EngineError::from_code(header.err));
                    }
                    None => warn!("handshake reply with no handshake in flight"),
                }
            }
            PING_XID => trace!("keepalive ping acknowledged"),
            NOTIFICATION_XID => {
                let mut body = payload;
                match WatchPush::decode(&mut body) {
                    Ok(push) => self.dispatcher.emit(DispatchEvent::Watch(push)),
                    Err(e) => warn!("undecodable watch push: {e}"),
                }
            }
            SERVER_XID => {
                let mut body = payload;
                match SessionNotice::decode(&mut body) {
                    Ok(notice) => match notice.kind {
                        NoticeKind::SessionExpired => self.expire_session(),
                        NoticeKind::ServerShutdown => {
                            info!("server announced shutdown, reopening elsewhere");
                            self.request_reopen();
                        }
                    },
                    Err(e) => warn!("undecodable session notice: {e}"),
                }
            }
            AUTH_XID => match header.err {
                e if e.is_ok() => debug!("credentials accepted"),
                directory_wire::ErrorCode::AuthFailed => self.fail_auth(),
                directory_wire::ErrorCode::SessionExpired => self.expire_session(),
                other => {
                    warn!(?other, "auth submission failed, reopening");
                    self.request_reopen();
                }
            },
            _ => {
                let outcome = self.pending.match_reply(header, payload);
                for packet in outcome.lost {
                    self.dispatcher.emit(DispatchEvent::Finished(packet));
                }
                if let Some(packet) = outcome.matched {
                    self.dispatcher.emit(DispatchEvent::Finished(packet));
                }
            }
        }
    }

    fn on_disconnect(&self) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        debug!("transport reported disconnect");
        if self.status() == ConnectionStatus::Connected {
            self.set_status(ConnectionStatus::NotConnected);
        }
        for packet in self.pending.drain_all(EngineError::ConnectionLoss) {
            self.dispatcher.emit(DispatchEvent::Finished(packet));
        }
        self.request_reopen();
    }
}
