//! Stream multiplexing within sessions.
//!
//! Streams are logical bidirectional byte channels carried over one relay
//! Session. Each stream is announced with `Open`, carries `Data` both ways,
//! and is half-closed per direction with `Close`:
//!
//! ```text
//!            local close            remote close
//!   Open ───────────────► HalfClosed ───────────────► Closed
//!     │   remote close        ▲                          ▲
//!     └───────────────────────┘                          │
//!     └──── Reset / send failure / Session teardown ─────┘
//! ```
//!
//! Stream ids come from one process-wide counter and are never reused.
//! Inbound payloads queue per stream up to [`STREAM_INBOUND_CAPACITY`]; a
//! reader further behind than that has its stream reset.

use crate::error::StreamError;
use crate::protocol::{MAX_DATA_PAYLOAD, RelayMessage};
use crate::session::Session;
use crate::stats::StatsAggregator;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Payloads buffered per stream before it is reset (at most 4 MiB)
pub const STREAM_INBOUND_CAPACITY: usize = 64;

/// Allocate a fresh stream id
pub(crate) fn next_stream_id() -> u64 {
    NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)
}

/// Stream lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Both directions open
    Open,
    /// One direction closed
    HalfClosed,
    /// Both directions closed, reset, or Session gone
    Closed,
}

#[derive(Debug)]
struct Flags {
    state: StreamState,
    local_closed: bool,
    remote_closed: bool,
    reset: bool,
    overflowed: bool,
}

/// State shared between a [`Stream`] handle and its Session's [`StreamMux`]
#[derive(Debug)]
pub(crate) struct StreamShared {
    id: u64,
    flags: Mutex<Flags>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    inbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl StreamShared {
    fn new(id: u64, inbound: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            id,
            flags: Mutex::new(Flags {
                state: StreamState::Open,
                local_closed: false,
                remote_closed: false,
                reset: false,
                overflowed: false,
            }),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            inbound: Mutex::new(Some(inbound)),
        }
    }

    fn state(&self) -> StreamState {
        self.flags.lock().state
    }

    /// Pending and future reads see end-of-stream
    fn end_inbound(&self) {
        self.inbound.lock().take();
    }

    /// Move to Closed; returns true only for the call that did it
    fn mark_closed(&self, reset: bool) -> bool {
        let mut flags = self.flags.lock();
        if flags.state == StreamState::Closed {
            return false;
        }
        flags.state = StreamState::Closed;
        flags.local_closed = true;
        flags.remote_closed = true;
        flags.reset |= reset;
        true
    }
}

/// Per-Session stream table
#[derive(Debug)]
pub(crate) struct StreamMux {
    streams: DashMap<u64, Arc<StreamShared>>,
    stats: Arc<StatsAggregator>,
}

impl StreamMux {
    pub(crate) fn new(stats: Arc<StatsAggregator>) -> Self {
        Self {
            streams: DashMap::new(),
            stats,
        }
    }

    /// Register a new stream and count it as opened
    fn register(&self) -> (Arc<StreamShared>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(STREAM_INBOUND_CAPACITY);
        let shared = Arc::new(StreamShared::new(next_stream_id(), tx));
        self.streams.insert(shared.id, Arc::clone(&shared));
        self.stats.stream_opened();
        (shared, rx)
    }

    /// Close a stream and drop it from the table (once)
    ///
    /// Readers are woken last so they observe the final state and counters.
    fn finish(&self, shared: &StreamShared, reset: bool) {
        if shared.mark_closed(reset) {
            self.streams.remove(&shared.id);
            self.stats.stream_closed();
        }
        shared.end_inbound();
    }

    /// Number of streams not yet Closed
    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }

    /// Route an inbound stream frame
    ///
    /// Returns a frame to send back to the relay, if any.
    pub(crate) fn dispatch(&self, message: RelayMessage) -> Option<RelayMessage> {
        let stream_id = message.stream_id()?;
        let Some(shared) = self.streams.get(&stream_id).map(|s| Arc::clone(s.value())) else {
            tracing::debug!(
                "Ignoring {} frame for unknown stream {}",
                message.message_type(),
                stream_id
            );
            return None;
        };

        match message {
            RelayMessage::Data { payload, .. } => {
                if shared.flags.lock().remote_closed {
                    tracing::debug!("Ignoring Data after remote Close on stream {}", stream_id);
                    return None;
                }
                let len = payload.len() as u64;
                shared.bytes_received.fetch_add(len, Ordering::Relaxed);
                self.stats.record_received(len);
                let full = match shared.inbound.lock().as_ref() {
                    Some(tx) => matches!(tx.try_send(payload), Err(TrySendError::Full(_))),
                    // Receiver gone means the handle was dropped; bytes are still counted
                    None => false,
                };
                if full {
                    tracing::warn!(
                        "Stream {} reader is {} payloads behind; resetting",
                        stream_id,
                        STREAM_INBOUND_CAPACITY
                    );
                    shared.flags.lock().overflowed = true;
                    self.finish(&shared, true);
                    return Some(RelayMessage::Reset { stream_id });
                }
            }
            RelayMessage::Close { .. } => {
                let fully_closed = {
                    let mut flags = shared.flags.lock();
                    flags.remote_closed = true;
                    if flags.local_closed {
                        true
                    } else {
                        flags.state = StreamState::HalfClosed;
                        false
                    }
                };
                if fully_closed {
                    self.finish(&shared, false);
                } else {
                    shared.end_inbound();
                }
            }
            RelayMessage::Reset { .. } => {
                tracing::debug!("Stream {} reset by relay", stream_id);
                self.finish(&shared, true);
            }
            RelayMessage::Open { .. } => {
                tracing::debug!("Ignoring relay Open for existing stream {}", stream_id);
            }
            _ => {}
        }
        None
    }

    /// Close every stream synchronously (Session teardown)
    pub(crate) fn close_all(&self) {
        let streams: Vec<Arc<StreamShared>> = self
            .streams
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for shared in streams {
            self.finish(&shared, false);
        }
    }
}

impl Drop for StreamMux {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// A multiplexed stream on a relay Session
///
/// Holds only a weak reference to its Session: a stream never keeps a
/// Session alive, and is Closed before its Session is discarded.
pub struct Stream {
    shared: Arc<StreamShared>,
    session: Weak<Session>,
    session_id: u64,
    inbound: mpsc::Receiver<Vec<u8>>,
}

impl Stream {
    /// Register and announce a new stream on `session`
    pub(crate) async fn open(session: &Arc<Session>) -> Result<Self, StreamError> {
        if !session.state().is_live() {
            return Err(StreamError::SessionClosed);
        }
        let (shared, inbound) = session.mux().register();
        let stream = Self {
            shared,
            session: Arc::downgrade(session),
            session_id: session.id(),
            inbound,
        };

        if session
            .send(RelayMessage::Open {
                stream_id: stream.id(),
            })
            .await
            .is_err()
        {
            session.mux().finish(&stream.shared, false);
            return Err(StreamError::SessionClosed);
        }
        if session.verbose() {
            tracing::debug!("Opened stream {} on session {}", stream.id(), session.id());
        }
        Ok(stream)
    }

    /// Stream id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Parent Session id
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Payload bytes written
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::Relaxed)
    }

    /// Payload bytes received
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::Relaxed)
    }

    /// Write `data`, split into frames of at most 64 KiB
    ///
    /// Counters are updated as each frame is handed to the Session writer.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Closed`] if this side already closed, or
    /// [`StreamError::SessionClosed`] if the Session cannot send; the latter
    /// closes the stream.
    pub async fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        {
            let flags = self.shared.flags.lock();
            if flags.overflowed {
                return Err(StreamError::Overflow(self.id()));
            }
            if flags.reset {
                return Err(StreamError::Reset(self.id()));
            }
            if flags.local_closed {
                return Err(StreamError::Closed(self.id()));
            }
        }
        let Some(session) = self.session.upgrade() else {
            self.shared.mark_closed(false);
            self.shared.end_inbound();
            return Err(StreamError::SessionClosed);
        };

        let mut written = 0;
        for chunk in data.chunks(MAX_DATA_PAYLOAD) {
            let message = RelayMessage::Data {
                stream_id: self.id(),
                payload: chunk.to_vec(),
            };
            if session.send(message).await.is_err() {
                session.mux().finish(&self.shared, false);
                return Err(StreamError::SessionClosed);
            }
            let len = chunk.len() as u64;
            self.shared.bytes_sent.fetch_add(len, Ordering::Relaxed);
            session.stats().record_sent(len);
            written += chunk.len();
        }
        Ok(written)
    }

    /// Read the next payload
    ///
    /// Returns `Ok(None)` at end-of-stream (remote Close or Session
    /// teardown).
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Reset`] if the relay reset the stream, or
    /// [`StreamError::Overflow`] once buffered payloads are drained after
    /// this reader fell more than [`STREAM_INBOUND_CAPACITY`] payloads
    /// behind.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        if let Some(payload) = self.inbound.recv().await {
            return Ok(Some(payload));
        }
        let flags = self.shared.flags.lock();
        if flags.overflowed {
            Err(StreamError::Overflow(self.id()))
        } else if flags.reset {
            Err(StreamError::Reset(self.id()))
        } else {
            Ok(None)
        }
    }

    /// Close the sending direction
    ///
    /// Once the relay has closed its direction too, the stream is Closed.
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), StreamError> {
        let fully_closed = {
            let mut flags = self.shared.flags.lock();
            if flags.local_closed {
                return Ok(());
            }
            flags.local_closed = true;
            if flags.remote_closed {
                true
            } else {
                flags.state = StreamState::HalfClosed;
                false
            }
        };

        let Some(session) = self.session.upgrade() else {
            self.shared.mark_closed(false);
            self.shared.end_inbound();
            return Err(StreamError::SessionClosed);
        };
        let sent = session
            .send(RelayMessage::Close {
                stream_id: self.id(),
            })
            .await;

        if fully_closed || sent.is_err() {
            session.mux().finish(&self.shared, false);
        }
        sent.map_err(|_| StreamError::SessionClosed)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.shared.state() == StreamState::Closed {
            return;
        }
        let local_closed = self.shared.flags.lock().local_closed;
        if let Some(session) = self.session.upgrade() {
            if !local_closed {
                session.try_send(RelayMessage::Close {
                    stream_id: self.id(),
                });
            }
            session.mux().finish(&self.shared, false);
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .field("bytes_sent", &self.bytes_sent())
            .field("bytes_received", &self.bytes_received())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mux() -> (StreamMux, Arc<StatsAggregator>) {
        let stats = Arc::new(StatsAggregator::new());
        (StreamMux::new(Arc::clone(&stats)), stats)
    }

    #[test]
    fn test_stream_ids_monotonic() {
        let a = next_stream_id();
        let b = next_stream_id();
        assert!(b > a);
        assert!(a >= 1);
    }

    #[test]
    fn test_dispatch_data_updates_counters() {
        let (mux, stats) = mux();
        let (shared, mut rx) = mux.register();

        mux.dispatch(RelayMessage::Data {
            stream_id: shared.id,
            payload: b"hello".to_vec(),
        });

        assert_eq!(rx.try_recv().unwrap(), b"hello");
        assert_eq!(shared.bytes_received.load(Ordering::Relaxed), 5);
        assert_eq!(stats.byte_counts(), (0, 5));
    }

    #[test]
    fn test_remote_close_half_closes_then_reset_closes() {
        let (mux, stats) = mux();
        let (shared, mut rx) = mux.register();

        mux.dispatch(RelayMessage::Close { stream_id: shared.id });
        assert_eq!(shared.state(), StreamState::HalfClosed);
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.stream_counts(), (1, 1));

        mux.dispatch(RelayMessage::Reset { stream_id: shared.id });
        assert_eq!(shared.state(), StreamState::Closed);
        assert!(shared.flags.lock().reset);
        assert_eq!(mux.len(), 0);
        assert_eq!(stats.stream_counts(), (0, 1));
    }

    #[test]
    fn test_data_after_remote_close_ignored() {
        let (mux, stats) = mux();
        let (shared, _rx) = mux.register();
        mux.dispatch(RelayMessage::Close { stream_id: shared.id });
        mux.dispatch(RelayMessage::Data {
            stream_id: shared.id,
            payload: vec![1; 8],
        });
        assert_eq!(stats.byte_counts(), (0, 0));
    }

    #[test]
    fn test_unknown_stream_ignored() {
        let (mux, stats) = mux();
        mux.dispatch(RelayMessage::Data {
            stream_id: u64::MAX,
            payload: vec![1, 2, 3],
        });
        assert_eq!(stats.byte_counts(), (0, 0));
    }

    #[test]
    fn test_slow_reader_overflow_resets_stream() {
        let (mux, stats) = mux();
        let (shared, mut rx) = mux.register();

        for _ in 0..STREAM_INBOUND_CAPACITY {
            let reply = mux.dispatch(RelayMessage::Data {
                stream_id: shared.id,
                payload: vec![0; 16],
            });
            assert_eq!(reply, None);
        }
        let reply = mux.dispatch(RelayMessage::Data {
            stream_id: shared.id,
            payload: vec![0; 16],
        });
        assert_eq!(reply, Some(RelayMessage::Reset { stream_id: shared.id }));
        assert_eq!(shared.state(), StreamState::Closed);
        assert!(shared.flags.lock().overflowed);
        assert_eq!(mux.len(), 0);
        assert_eq!(stats.stream_counts(), (0, 1));

        // Frames after the reset are for an unknown stream
        assert_eq!(
            mux.dispatch(RelayMessage::Data {
                stream_id: shared.id,
                payload: vec![0; 16],
            }),
            None
        );

        for _ in 0..STREAM_INBOUND_CAPACITY {
            assert!(rx.try_recv().is_ok());
        }
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_close_all_ends_readers_once() {
        let (mux, stats) = mux();
        let (a, mut rx_a) = mux.register();
        let (b, _rx_b) = mux.register();

        mux.close_all();
        mux.close_all();

        assert_eq!(a.state(), StreamState::Closed);
        assert_eq!(b.state(), StreamState::Closed);
        assert!(matches!(
            rx_a.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(stats.stream_counts(), (0, 2));
    }
}
