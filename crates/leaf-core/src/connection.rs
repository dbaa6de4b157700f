//! Connection management for relay Sessions
//!
//! The [`ConnectionManager`] keeps one supervisor task per node in the
//! current discovery snapshot. A supervisor dials its node (directly or
//! through a proxy tunnel), performs the relay handshake, then waits for the
//! Session to end and retries with exponential backoff:
//!
//! ```text
//! supervisor ──► dial ──► tunnel ──► Hello/HelloAck ──► Connected
//!     ▲                                                    │
//!     │              backoff (reset after Connected)       ▼
//!     └──────────────────────────────────────────── Session ends
//! ```
//!
//! Each live Session runs three tasks: a reader that turns the socket into
//! frames, a writer that drains the outbound queue, and a driver that
//! dispatches inbound frames, sends keepalives and tracks health.

use crate::backoff::{Backoff, RetryConfig};
use crate::config::ClientConfig;
use crate::error::{ConnectionError, ProtocolError};
use crate::protocol::{RelayMessage, read_frame, write_frame};
use crate::selection::ProxyPool;
use crate::session::{Session, SessionState, Transport};
use crate::stats::{ExitPoint, StatsAggregator};
use dashmap::DashMap;
use leaf_discovery::{NodeDirectory, NodeSet, RelayNode};
use leaf_proxy::open_tunnel;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// How long a closing Session's writer gets to flush `Goodbye`
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Inbound frames buffered between reader and driver
const INBOUND_QUEUE_DEPTH: usize = 64;

type FrameResult = Result<Option<RelayMessage>, ProtocolError>;

/// Per-Session connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Sent in `Hello`
    pub device_id: String,
    /// Sent as `x-partner-id` when non-empty
    pub partner_id: Option<String>,
    /// Reconnection backoff
    pub retry: RetryConfig,
    /// Dial / tunnel timeout
    pub connect_timeout: Duration,
    /// `Hello` -> `HelloAck` timeout
    pub handshake_timeout: Duration,
    /// Time between pings
    pub keepalive_interval: Duration,
    /// Inbound silence before Degraded
    pub degraded_after: Duration,
    /// Inbound silence before the Session is closed
    pub dead_after: Duration,
    /// Largest accepted frame
    pub max_frame_size: usize,
    /// Per-attempt / per-frame diagnostics
    pub verbose: bool,
}

impl ConnectionSettings {
    /// Extract connection parameters from a client configuration
    #[must_use]
    pub fn from_config(config: &ClientConfig, device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            partner_id: config.partner_id.clone(),
            retry: config.retry.clone(),
            connect_timeout: config.connect_timeout,
            handshake_timeout: config.handshake_timeout,
            keepalive_interval: config.keepalive_interval,
            degraded_after: config.degraded_after,
            dead_after: config.dead_after,
            max_frame_size: config.max_frame_size,
            verbose: config.verbose,
        }
    }

    /// Health check period: frequent enough to notice Degraded promptly
    fn health_tick(&self) -> Duration {
        (self.degraded_after / 4)
            .min(self.keepalive_interval)
            .max(Duration::from_millis(10))
    }
}

/// State shared with supervisor and driver tasks
struct Shared {
    settings: ConnectionSettings,
    proxies: ProxyPool,
    directory: Arc<NodeDirectory>,
    stats: Arc<StatsAggregator>,
    sessions: DashMap<String, Arc<Session>>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Receiver<bool>,
}

struct Supervisor {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owner of all relay Sessions
pub struct ConnectionManager {
    shared: Arc<Shared>,
    supervisors: Mutex<HashMap<String, Supervisor>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager; nothing is dialed until [`sync_nodes`](Self::sync_nodes)
    ///
    /// `shutdown` flipping to `true` stops every supervisor and Session.
    #[must_use]
    pub fn new(
        settings: ConnectionSettings,
        proxies: ProxyPool,
        directory: Arc<NodeDirectory>,
        stats: Arc<StatsAggregator>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                proxies,
                directory,
                stats,
                sessions: DashMap::new(),
                drivers: Mutex::new(Vec::new()),
                shutdown,
            }),
            supervisors: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Reconcile supervisors with a new snapshot
    ///
    /// Nodes that left the snapshot have their supervisor cancelled and
    /// their Session closed; new nodes get a supervisor. Must be called
    /// from within a Tokio runtime.
    pub fn sync_nodes(&self, nodes: &NodeSet) {
        if *self.shared.shutdown.borrow() {
            return;
        }

        let mut supervisors = self.supervisors.lock();
        let removed: Vec<String> = supervisors
            .keys()
            .filter(|address| !nodes.contains(address))
            .cloned()
            .collect();

        for address in removed {
            if let Some(supervisor) = supervisors.remove(&address) {
                supervisor.cancel.send_replace(true);
                self.retired.lock().push(supervisor.handle);
            }
            if let Some((_, session)) = self.shared.sessions.remove(&address) {
                session.close(Some("node removed from discovery snapshot".to_string()));
            }
            tracing::info!("Relay node {} left the snapshot", address);
        }

        for node in nodes {
            if supervisors.contains_key(node.address()) {
                continue;
            }
            let (cancel, cancel_rx) = watch::channel(false);
            let shared = Arc::clone(&self.shared);
            let task_node = node.clone();
            let handle = tokio::spawn(async move {
                shared.supervise(task_node, cancel_rx).await;
            });
            supervisors.insert(node.address().to_string(), Supervisor { cancel, handle });
        }
        drop(supervisors);

        self.retired.lock().retain(|handle| !handle.is_finished());
        self.shared
            .drivers
            .lock()
            .retain(|handle| !handle.is_finished());
    }

    /// Dial `node` over `transport` and run the handshake
    ///
    /// The returned Session is Connected and already has its reader, writer
    /// and driver tasks running. It is not supervised: when it ends it is
    /// not retried.
    ///
    /// # Errors
    ///
    /// Returns the [`ConnectionError`] of the failing phase.
    pub async fn connect(
        &self,
        node: &RelayNode,
        transport: Transport,
    ) -> Result<Arc<Session>, ConnectionError> {
        self.shared.connect(node, transport).await
    }

    /// Cancel every supervisor and close every Session
    pub fn close_all(&self) {
        let supervisors: Vec<Supervisor> = self
            .supervisors
            .lock()
            .drain()
            .map(|(_, supervisor)| supervisor)
            .collect();
        {
            let mut retired = self.retired.lock();
            for supervisor in supervisors {
                supervisor.cancel.send_replace(true);
                retired.push(supervisor.handle);
            }
        }

        let sessions: Vec<Arc<Session>> = self
            .shared
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.shared.sessions.clear();
        for session in sessions {
            session.close(Some("client stopped".to_string()));
        }
    }

    /// Close everything and wait for background tasks until `deadline`,
    /// aborting whatever is still running then
    ///
    /// Supervisors are joined before drivers: a supervisor finishing a
    /// dial can still register a driver until it exits.
    pub async fn shutdown(&self, deadline: Instant) {
        let seen: Vec<Arc<Session>> = self.sessions();

        self.close_all();

        let deadline = time::Instant::from_std(deadline);
        let supervisors = std::mem::take(&mut *self.retired.lock());
        let mut aborted = join_until(deadline, supervisors).await;

        // Sessions a late supervisor inserted after close_all
        let late = self.sessions();
        self.close_all();

        let drivers = std::mem::take(&mut *self.shared.drivers.lock());
        aborted += join_until(deadline, drivers).await;

        for session in seen.into_iter().chain(late) {
            session.abort_tasks();
        }

        if aborted > 0 {
            tracing::warn!("Aborted {} tasks still running after the grace period", aborted);
        }
    }

    /// All tracked Sessions (any state)
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.shared
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Exit points of live Sessions whose node is in `nodes`
    #[must_use]
    pub fn exit_points(&self, nodes: &NodeSet) -> Vec<ExitPoint> {
        self.shared
            .sessions
            .iter()
            .filter(|entry| entry.value().state().is_live() && nodes.contains(entry.key()))
            .map(|entry| entry.value().exit_point())
            .collect()
    }

    /// Number of live Sessions whose node is in `nodes`
    #[must_use]
    pub fn connected_nodes(&self, nodes: &NodeSet) -> usize {
        self.shared
            .sessions
            .iter()
            .filter(|entry| entry.value().state().is_live() && nodes.contains(entry.key()))
            .count()
    }

    /// Healthiest live Session: Connected before Degraded, then fewest
    /// active streams
    #[must_use]
    pub fn least_loaded_session(&self) -> Option<Arc<Session>> {
        self.shared
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .filter(|session| session.state().is_live())
            .min_by_key(|session| {
                (
                    session.state() != SessionState::Connected,
                    session.stream_count(),
                )
            })
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for supervisor in self.supervisors.lock().values() {
            supervisor.handle.abort();
        }
    }
}

impl Shared {
    fn is_cancelled(&self, cancel: &watch::Receiver<bool>) -> bool {
        *cancel.borrow() || *self.shutdown.borrow()
    }

    /// Resolves once the node is cancelled or the client shuts down
    async fn cancelled(&self, cancel: &watch::Receiver<bool>) {
        let mut cancel = cancel.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            () = signalled(&mut cancel) => {}
            () = signalled(&mut shutdown) => {}
        }
    }

    /// Reconnect loop for one node
    async fn supervise(self: Arc<Self>, node: RelayNode, cancel: watch::Receiver<bool>) {
        let address = node.address().to_string();
        let mut backoff = Backoff::new(self.settings.retry.clone());

        tracing::debug!("Supervisor for {} started", address);

        loop {
            if self.is_cancelled(&cancel) {
                break;
            }

            let node_index = self.directory.current().position(&address).unwrap_or(0);
            let transport = self.proxies.select(node_index);
            if self.settings.verbose {
                tracing::debug!(
                    "Dialing {} via {} (attempt {})",
                    address,
                    transport,
                    backoff.attempt() + 1
                );
            }

            let attempt = tokio::select! {
                result = self.connect(&node, transport) => result,
                () = self.cancelled(&cancel) => break,
            };

            let error = match attempt {
                Ok(session) => {
                    backoff.reset();
                    self.sessions.insert(address.clone(), Arc::clone(&session));

                    let mut closed = session.closed_signal();
                    tokio::select! {
                        () = signalled(&mut closed) => {}
                        () = self.cancelled(&cancel) => {
                            session.close(None);
                        }
                    }
                    self.sessions
                        .remove_if(&address, |_, current| current.id() == session.id());

                    if self.is_cancelled(&cancel) {
                        break;
                    }
                    ConnectionError::Closed(
                        session
                            .last_error()
                            .unwrap_or_else(|| "session ended".to_string()),
                    )
                }
                Err(e) => e,
            };

            if error.is_transient() {
                tracing::warn!("Relay {} unavailable: {}", address, error);
            } else {
                tracing::error!("Relay {} refused session: {}", address, error);
            }
            self.stats.set_last_error(format!("{address}: {error}"));

            let delay = backoff.next_delay();
            if self.settings.verbose {
                tracing::debug!("Retrying {} in {:?}", address, delay);
            }
            tokio::select! {
                () = time::sleep(delay) => {}
                () = self.cancelled(&cancel) => break,
            }
            self.stats.record_reconnect();
        }

        if let Some((_, session)) = self
            .sessions
            .remove_if(&address, |_, session| session.is_closed())
        {
            tracing::trace!("Dropped closed session {}", session.id());
        }
        tracing::debug!("Supervisor for {} stopped", address);
    }

    async fn connect(
        self: &Arc<Self>,
        node: &RelayNode,
        transport: Transport,
    ) -> Result<Arc<Session>, ConnectionError> {
        let (session, outbound) = Session::new(
            node.clone(),
            transport,
            Arc::clone(&self.stats),
            self.settings.verbose,
        );

        let result = self.establish(&session).await;
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                session.close(Some(e.to_string()));
                return Err(e);
            }
        };

        tracing::info!(
            "Session {} to {} connected via {} (relay {}, exit {})",
            session.id(),
            node.address(),
            session.transport(),
            session.relay_id().unwrap_or_default(),
            session.exit_address().unwrap_or_default()
        );

        let (reader, writer) = stream.into_split();
        let (frames_tx, frames_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let max_frame_size = self.settings.max_frame_size;

        let reader_task = tokio::spawn(read_loop(reader, frames_tx, max_frame_size));
        let writer_task = tokio::spawn(write_loop(
            writer,
            outbound,
            Arc::clone(&session),
            max_frame_size,
        ));
        session.register_task(reader_task.abort_handle());
        session.register_task(writer_task.abort_handle());

        let shared = Arc::clone(self);
        let driven = Arc::clone(&session);
        let driver = tokio::spawn(async move {
            shared.drive(driven, frames_rx, writer_task).await;
        });
        self.drivers.lock().push(driver);

        Ok(session)
    }

    /// Dial, tunnel and handshake
    async fn establish(&self, session: &Session) -> Result<TcpStream, ConnectionError> {
        let node = session.node();
        let timeout = self.settings.connect_timeout;

        let mut stream = match session.transport() {
            Transport::Direct => {
                let stream = time::timeout(timeout, TcpStream::connect((node.host(), node.port())))
                    .await
                    .map_err(|_| ConnectionError::Timeout("connect"))?
                    .map_err(|e| ConnectionError::Dial(format!("{}: {e}", node.address())))?;
                stream
                    .set_nodelay(true)
                    .map_err(|e| ConnectionError::Dial(e.to_string()))?;
                stream
            }
            Transport::Proxied(directive) => {
                open_tunnel(directive, node.host(), node.port(), timeout).await?
            }
        };

        let (relay_id, exit_address) = time::timeout(
            self.settings.handshake_timeout,
            exchange_hello(&mut stream, &self.settings),
        )
        .await
        .map_err(|_| ConnectionError::Timeout("handshake"))??;

        session.mark_established(relay_id, exit_address)?;
        Ok(stream)
    }

    /// Session driver: inbound dispatch, keepalive and health
    async fn drive(
        self: Arc<Self>,
        session: Arc<Session>,
        mut frames: mpsc::Receiver<FrameResult>,
        mut writer_task: JoinHandle<()>,
    ) {
        let result = self.drive_loop(&session, &mut frames).await;

        session.close(result.err().map(|e| e.to_string()));
        let _ = time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await;
        session.abort_tasks();
    }

    async fn drive_loop(
        &self,
        session: &Session,
        frames: &mut mpsc::Receiver<FrameResult>,
    ) -> Result<(), ConnectionError> {
        let settings = &self.settings;
        let mut ticker = time::interval(settings.health_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut closed = session.closed_signal();
        let mut shutdown = self.shutdown.clone();
        let mut last_ping = Instant::now();
        let mut nonce: u64 = 0;

        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(Ok(Some(message))) => self.handle_frame(session, message)?,
                    Some(Ok(None)) | None => {
                        return Err(ConnectionError::Closed("relay closed the connection".to_string()));
                    }
                    Some(Err(e)) => return Err(e.into()),
                },
                _ = ticker.tick() => {
                    let idle = session.idle_for();
                    if idle >= settings.dead_after {
                        return Err(ConnectionError::Closed(format!(
                            "no traffic from relay for {}s",
                            idle.as_secs()
                        )));
                    }
                    if idle >= settings.degraded_after && session.state() == SessionState::Connected {
                        session.transition_to(SessionState::Degraded)?;
                    }
                    if last_ping.elapsed() >= settings.keepalive_interval {
                        nonce = nonce.wrapping_add(1);
                        let queued = session.try_send(RelayMessage::Ping { nonce });
                        if settings.verbose {
                            tracing::trace!("Session {} ping {} queued={}", session.id(), nonce, queued);
                        }
                        last_ping = Instant::now();
                    }
                }
                () = signalled(&mut closed) => {
                    return Err(ConnectionError::Closed(
                        session.last_error().unwrap_or_else(|| "closed locally".to_string()),
                    ));
                }
                () = signalled(&mut shutdown) => return Ok(()),
            }
        }
    }

    fn handle_frame(&self, session: &Session, message: RelayMessage) -> Result<(), ConnectionError> {
        session.touch();
        if session.state() == SessionState::Degraded {
            session.transition_to(SessionState::Connected)?;
            tracing::info!("Session {} to {} recovered", session.id(), session.node().address());
        }
        if self.settings.verbose {
            tracing::debug!("Session {} <- {}", session.id(), message.message_type());
        }

        match message {
            RelayMessage::Ping { nonce } => {
                session.try_send(RelayMessage::Pong { nonce });
            }
            RelayMessage::Pong { .. } => {}
            RelayMessage::Goodbye => {
                return Err(ConnectionError::Closed("relay said goodbye".to_string()));
            }
            RelayMessage::Reject { code, reason } => {
                return Err(ConnectionError::Rejected { code, reason });
            }
            RelayMessage::Hello { .. } | RelayMessage::HelloAck { .. } => {
                return Err(ProtocolError::Unexpected(message.message_type()).into());
            }
            stream_frame => {
                if let Some(reply) = session.mux().dispatch(stream_frame) {
                    session.try_send(reply);
                }
            }
        }
        Ok(())
    }
}

/// Await `handles` until `deadline`, aborting the rest; returns how many
/// were aborted
async fn join_until(deadline: time::Instant, handles: Vec<JoinHandle<()>>) -> usize {
    let mut aborted = 0;
    for mut handle in handles {
        if time::timeout_at(deadline, &mut handle).await.is_err() {
            handle.abort();
            aborted += 1;
        }
    }
    aborted
}

/// Resolves once `signal` is `true` or its sender is gone
pub(crate) async fn signalled(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|set| *set).await;
}

/// Send `Hello`, expect `HelloAck`
async fn exchange_hello(
    stream: &mut TcpStream,
    settings: &ConnectionSettings,
) -> Result<(String, String), ConnectionError> {
    let hello = RelayMessage::hello(
        crate::VERSION,
        &settings.device_id,
        settings.partner_id.as_deref(),
    );
    write_frame(stream, &hello, settings.max_frame_size).await?;

    match read_frame(stream, settings.max_frame_size).await? {
        Some(RelayMessage::HelloAck {
            relay_id,
            exit_address,
        }) => Ok((relay_id, exit_address)),
        Some(RelayMessage::Reject { code, reason }) => {
            Err(ConnectionError::Rejected { code, reason })
        }
        Some(other) => Err(ProtocolError::Unexpected(other.message_type()).into()),
        None => Err(ConnectionError::Closed(
            "relay hung up during handshake".to_string(),
        )),
    }
}

/// Socket -> frame queue
async fn read_loop(mut reader: OwnedReadHalf, frames: mpsc::Sender<FrameResult>, max_frame_size: usize) {
    loop {
        let frame = read_frame(&mut reader, max_frame_size).await;
        let last = !matches!(frame, Ok(Some(_)));
        if frames.send(frame).await.is_err() || last {
            break;
        }
    }
}

/// Outbound queue -> socket; says `Goodbye` when the Session closes
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<RelayMessage>,
    session: Arc<Session>,
    max_frame_size: usize,
) {
    let mut closed = session.closed_signal();
    loop {
        tokio::select! {
            biased;
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if session.verbose() {
                    tracing::trace!("Session {} -> {}", session.id(), message.message_type());
                }
                if let Err(e) = write_frame(&mut writer, &message, max_frame_size).await {
                    session.close(Some(format!("write failed: {e}")));
                    return;
                }
            }
            () = signalled(&mut closed) => break,
        }
    }
    let _ = write_frame(&mut writer, &RelayMessage::Goodbye, max_frame_size).await;
    let _ = writer.shutdown().await;
}
