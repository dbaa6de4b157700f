//! Session state machine.
//!
//! A Session is one connection attempt to one relay node. It starts in
//! `Connecting`, and a fresh Session object is created for every attempt:
//!
//! ```text
//! Connecting ──► Connected ◄──► Degraded
//!     │              │              │
//!     └──────────────┴──────┬───────┘
//!                           ▼
//!                        Closed (terminal)
//! ```

use crate::error::{ConnectionError, StreamError};
use crate::mux::{Stream, StreamMux};
use crate::protocol::RelayMessage;
use crate::stats::{ExitPoint, StatsAggregator};
use leaf_discovery::RelayNode;
use leaf_proxy::ProxyDirective;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

/// Outbound frames queued per Session before writers wait
const OUTBOUND_QUEUE_DEPTH: usize = 256;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Dialing, tunnelling or handshaking
    Connecting,
    /// Handshake done, traffic flowing
    Connected,
    /// Connected but the relay has been silent too long
    Degraded,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Lowercase name used in logs and exit points
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        }
    }

    /// Connected or Degraded
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Degraded)
    }

    /// Check whether `self -> to` is a legal transition
    ///
    /// Staying in the same non-terminal state is allowed.
    #[must_use]
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::{Closed, Connected, Connecting, Degraded};
        matches!(
            (self, to),
            (Connecting, Connecting | Connected | Closed)
                | (Connected, Connected | Degraded | Closed)
                | (Degraded, Degraded | Connected | Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a Session reaches its relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Plain TCP
    Direct,
    /// Through a proxy tunnel
    Proxied(ProxyDirective),
}

impl fmt::Display for Transport {
    /// Renders the proxy without credentials
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Direct => f.write_str("direct"),
            Transport::Proxied(directive) => f.write_str(&directive.url_without_credentials()),
        }
    }
}

#[derive(Debug, Clone)]
struct ExitInfo {
    relay_id: String,
    exit_address: String,
}

/// One relay connection attempt
pub struct Session {
    id: u64,
    node: RelayNode,
    transport: Transport,
    state: Mutex<SessionState>,
    last_error: Mutex<Option<String>>,
    exit: RwLock<Option<ExitInfo>>,
    connected_at: Mutex<Option<Instant>>,
    last_inbound: Mutex<Instant>,
    outbound: mpsc::Sender<RelayMessage>,
    closed: watch::Sender<bool>,
    mux: StreamMux,
    stats: Arc<StatsAggregator>,
    tasks: Mutex<Vec<AbortHandle>>,
    verbose: bool,
}

impl Session {
    /// Create a Session in `Connecting`, with the receiving end of its
    /// outbound queue
    pub(crate) fn new(
        node: RelayNode,
        transport: Transport,
        stats: Arc<StatsAggregator>,
        verbose: bool,
    ) -> (Arc<Self>, mpsc::Receiver<RelayMessage>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            node,
            transport,
            state: Mutex::new(SessionState::Connecting),
            last_error: Mutex::new(None),
            exit: RwLock::new(None),
            connected_at: Mutex::new(None),
            last_inbound: Mutex::new(Instant::now()),
            outbound,
            closed,
            mux: StreamMux::new(Arc::clone(&stats)),
            stats,
            tasks: Mutex::new(Vec::new()),
            verbose,
        });
        (session, outbound_rx)
    }

    /// Session id (process-wide, never reused)
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Relay node
    #[must_use]
    pub fn node(&self) -> &RelayNode {
        &self.node
    }

    /// Transport used
    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Error that ended (or is degrading) this Session
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Relay id from `HelloAck`
    #[must_use]
    pub fn relay_id(&self) -> Option<String> {
        self.exit.read().as_ref().map(|e| e.relay_id.clone())
    }

    /// Client address as observed by the relay
    #[must_use]
    pub fn exit_address(&self) -> Option<String> {
        self.exit.read().as_ref().map(|e| e.exit_address.clone())
    }

    /// Time since the Session reached Connected
    #[must_use]
    pub fn connected_for(&self) -> Option<Duration> {
        self.connected_at.lock().map(|at| at.elapsed())
    }

    /// Time since the last inbound frame
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_inbound.lock().elapsed()
    }

    /// Streams not yet Closed
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.mux.len()
    }

    /// True once Closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Open a stream on this Session
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::SessionClosed`] unless the Session is live.
    pub async fn open_stream(self: &Arc<Self>) -> Result<Stream, StreamError> {
        Stream::open(self).await
    }

    /// Relay-reported view of this Session
    #[must_use]
    pub fn exit_point(&self) -> ExitPoint {
        let exit = self.exit.read().clone();
        ExitPoint {
            node: self.node.address().to_string(),
            node_id: self.node.identifier().to_string(),
            relay_id: exit.as_ref().map(|e| e.relay_id.clone()).unwrap_or_default(),
            exit_address: exit.map(|e| e.exit_address).unwrap_or_default(),
            transport: self.transport.to_string(),
            state: self.state().as_str().to_string(),
            connected_seconds: self.connected_for().map_or(0, |d| d.as_secs()),
        }
    }

    /// Validated state transition, returning the previous state
    ///
    /// Use [`close`](Self::close) to reach Closed.
    pub(crate) fn transition_to(&self, to: SessionState) -> Result<SessionState, ConnectionError> {
        let mut state = self.state.lock();
        let from = *state;
        if to == SessionState::Closed || !from.can_transition_to(to) {
            return Err(ConnectionError::InvalidTransition { from, to });
        }
        *state = to;
        drop(state);

        if from != to {
            match to {
                SessionState::Degraded => tracing::warn!(
                    "Session {} to {} degraded (idle {:?})",
                    self.id,
                    self.node.address(),
                    self.idle_for()
                ),
                _ if self.verbose => {
                    tracing::debug!("Session {} {} -> {}", self.id, from, to);
                }
                _ => {}
            }
        }
        Ok(from)
    }

    /// Record the handshake result and move to Connected
    pub(crate) fn mark_established(
        &self,
        relay_id: String,
        exit_address: String,
    ) -> Result<(), ConnectionError> {
        *self.exit.write() = Some(ExitInfo {
            relay_id,
            exit_address,
        });
        self.transition_to(SessionState::Connected)?;
        *self.connected_at.lock() = Some(Instant::now());
        self.touch();
        Ok(())
    }

    /// An inbound frame arrived
    pub(crate) fn touch(&self) {
        *self.last_inbound.lock() = Instant::now();
    }

    /// Queue a frame for the writer task
    pub(crate) async fn send(&self, message: RelayMessage) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::SessionClosed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| StreamError::SessionClosed)
    }

    /// Queue a frame without waiting; false if the queue is full or closed
    pub(crate) fn try_send(&self, message: RelayMessage) -> bool {
        !self.is_closed() && self.outbound.try_send(message).is_ok()
    }

    /// Close the Session: terminal state, every stream Closed, writer told
    /// to say Goodbye
    ///
    /// Idempotent; only the first reason is kept.
    pub fn close(&self, reason: Option<String>) {
        let from = {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            std::mem::replace(&mut *state, SessionState::Closed)
        };
        if let Some(reason) = reason {
            let mut last_error = self.last_error.lock();
            if last_error.is_none() {
                *last_error = Some(reason);
            }
        }

        self.mux.close_all();
        self.closed.send_replace(true);

        tracing::info!(
            "Session {} to {} closed (was {}){}",
            self.id,
            self.node.address(),
            from,
            self.last_error()
                .map(|e| format!(": {e}"))
                .unwrap_or_default()
        );
    }

    /// Watch that flips to `true` on close
    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Track a task to abort on teardown
    pub(crate) fn register_task(&self, handle: AbortHandle) {
        self.tasks.lock().push(handle);
    }

    /// Abort the Session's reader / writer tasks
    pub(crate) fn abort_tasks(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    pub(crate) fn mux(&self) -> &StreamMux {
        &self.mux
    }

    pub(crate) fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub(crate) fn verbose(&self) -> bool {
        self.verbose
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("node", &self.node.address())
            .field("transport", &self.transport.to_string())
            .field("state", &self.state())
            .field("streams", &self.stream_count())
            .finish_non_exhaustive()
    }
}
