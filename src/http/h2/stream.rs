//! HTTP/2 stream management
//!
//! This module implements the stream lifecycle of RFC 9113 Section 5.1 as a
//! plain state machine: every transition is a method that either moves the
//! stream to its next state or returns a [`StreamError`] describing why the
//! frame is not allowed, so the connection can decide between ignoring it,
//! resetting the stream, or failing the connection.

use super::error::{Error, ErrorCode};
use super::flow_control::FlowControl;
use super::MAX_STREAM_ID;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Stream ID type
pub type StreamId = u32;

/// How long frames for a stream we reset are silently dropped
pub const RESET_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Upper bound on closed streams remembered at once
const MAX_REMEMBERED_CLOSED: usize = 1024;

/// Why a stream reached `Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Both sides sent END_STREAM
    EndStream,
    /// We sent RST_STREAM
    LocalReset,
    /// The peer sent RST_STREAM
    RemoteReset,
}

/// Stream state as defined in RFC 9113 Section 5.1
///
/// The reserved states belong to server push, which this client always
/// disables, so no transition ever enters them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    /// We sent END_STREAM, the peer may still send
    HalfClosedLocal,
    /// The peer sent END_STREAM, we may still send
    HalfClosedRemote,
    Closed(CloseCause),
}

impl StreamState {
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed(_))
    }
}

/// What the connection should do with a frame that passed the state check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Deliver it
    Accept,
    /// Drop it silently (late frame on a stream we already closed)
    Ignore,
}

/// Frame kinds a transition can be asked about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SendHeaders,
    SendData,
    RecvHeaders,
    RecvData,
    RecvReset,
    RecvWindowUpdate,
}

/// An illegal transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{action:?} not allowed in state {state:?}")]
pub struct StreamError {
    pub action: Action,
    pub state: StreamState,
    pub code: ErrorCode,
    /// Whether the violation is fatal for the whole connection
    pub connection: bool,
}

impl StreamError {
    fn stream(action: Action, state: StreamState, code: ErrorCode) -> Self {
        StreamError {
            action,
            state,
            code,
            connection: false,
        }
    }

    fn connection(action: Action, state: StreamState, code: ErrorCode) -> Self {
        StreamError {
            action,
            state,
            code,
            connection: true,
        }
    }

    /// Lift into the HTTP/2 error taxonomy
    pub fn into_error(self, stream_id: StreamId) -> Error {
        if self.connection {
            Error::ConnectionFailed {
                code: self.code,
                reason: format!("stream {}: {}", stream_id, self),
            }
        } else {
            Error::stream(stream_id, self.code, self.to_string())
        }
    }
}

/// One HTTP/2 stream: lifecycle state plus its flow-control windows
#[derive(Debug)]
pub struct H2Stream {
    id: StreamId,
    state: StreamState,
    pub flow: FlowControl,
}

impl H2Stream {
    pub fn new(id: StreamId, flow: FlowControl) -> Self {
        H2Stream {
            id,
            state: StreamState::Idle,
            flow,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Send HEADERS (request headers or trailers)
    pub fn send_headers(&mut self, end_stream: bool) -> Result<(), StreamError> {
        self.state = match self.state {
            StreamState::Idle | StreamState::Open if !end_stream => StreamState::Open,
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote if end_stream => StreamState::Closed(CloseCause::EndStream),
            StreamState::HalfClosedRemote => StreamState::HalfClosedRemote,
            state => {
                return Err(StreamError::stream(Action::SendHeaders, state, ErrorCode::StreamClosed))
            }
        };
        Ok(())
    }

    /// Send DATA
    pub fn send_data(&mut self, end_stream: bool) -> Result<(), StreamError> {
        self.state = match self.state {
            StreamState::Open if end_stream => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote if end_stream => StreamState::Closed(CloseCause::EndStream),
            state @ (StreamState::Open | StreamState::HalfClosedRemote) => state,
            state => return Err(StreamError::stream(Action::SendData, state, ErrorCode::StreamClosed)),
        };
        Ok(())
    }

    /// Receive HEADERS (response headers, informational headers or trailers)
    pub fn recv_headers(&mut self, end_stream: bool) -> Result<Received, StreamError> {
        self.recv_frame(Action::RecvHeaders, end_stream)
    }

    /// Receive DATA
    pub fn recv_data(&mut self, end_stream: bool) -> Result<Received, StreamError> {
        self.recv_frame(Action::RecvData, end_stream)
    }

    fn recv_frame(&mut self, action: Action, end_stream: bool) -> Result<Received, StreamError> {
        match self.state {
            StreamState::Open => {
                if end_stream {
                    self.state = StreamState::HalfClosedRemote;
                }
                Ok(Received::Accept)
            }
            StreamState::HalfClosedLocal => {
                if end_stream {
                    self.state = StreamState::Closed(CloseCause::EndStream);
                }
                Ok(Received::Accept)
            }
            state @ StreamState::HalfClosedRemote => {
                Err(StreamError::stream(action, state, ErrorCode::StreamClosed))
            }
            StreamState::Closed(cause) => recv_after_close(cause, action),
            state => Err(StreamError::connection(action, state, ErrorCode::ProtocolError)),
        }
    }

    /// Receive RST_STREAM; late resets on closed streams are ignored
    pub fn recv_reset(&mut self) -> Result<Received, StreamError> {
        match self.state {
            StreamState::Idle => Err(StreamError::connection(
                Action::RecvReset,
                StreamState::Idle,
                ErrorCode::ProtocolError,
            )),
            StreamState::Closed(_) => Ok(Received::Ignore),
            _ => {
                self.state = StreamState::Closed(CloseCause::RemoteReset);
                Ok(Received::Accept)
            }
        }
    }

    /// Send RST_STREAM; returns false when the stream was already closed
    /// and no frame needs to go out
    pub fn send_reset(&mut self) -> bool {
        if self.state.is_closed() {
            return false;
        }
        self.state = StreamState::Closed(CloseCause::LocalReset);
        true
    }

    /// Receive WINDOW_UPDATE; tolerated in every state except idle
    pub fn recv_window_update(&self) -> Result<Received, StreamError> {
        match self.state {
            StreamState::Idle => Err(StreamError::connection(
                Action::RecvWindowUpdate,
                StreamState::Idle,
                ErrorCode::ProtocolError,
            )),
            StreamState::Closed(_) => Ok(Received::Ignore),
            _ => Ok(Received::Accept),
        }
    }
}

/// Decide the fate of a HEADERS or DATA frame for a stream that is
/// already closed, possibly one no longer tracked
pub fn recv_after_close(cause: CloseCause, action: Action) -> Result<Received, StreamError> {
    let state = StreamState::Closed(cause);
    match cause {
        CloseCause::LocalReset => Ok(Received::Ignore),
        CloseCause::RemoteReset => Err(StreamError::stream(action, state, ErrorCode::StreamClosed)),
        CloseCause::EndStream => Err(StreamError::connection(action, state, ErrorCode::StreamClosed)),
    }
}

/// Allocates stream ids and tracks the streams that are alive
///
/// Ids of the local parity (odd for clients, even for servers) increase
/// monotonically and are never reused.
#[derive(Debug)]
pub struct StreamManager<T> {
    is_client: bool,
    next_stream_id: StreamId,
    streams: HashMap<StreamId, T>,
    /// Streams that left the map, with how and when they closed
    recently_closed: VecDeque<(StreamId, CloseCause, Instant)>,
}

impl<T> StreamManager<T> {
    pub fn new(is_client: bool) -> Self {
        StreamManager {
            is_client,
            next_stream_id: if is_client { 1 } else { 2 },
            streams: HashMap::new(),
            recently_closed: VecDeque::new(),
        }
    }

    /// Reserve the next local stream id
    pub fn allocate_id(&mut self) -> Result<StreamId, Error> {
        if self.next_stream_id > MAX_STREAM_ID {
            return Err(Error::NotAccepting);
        }
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        Ok(id)
    }

    pub fn peek_next_stream_id(&self) -> StreamId {
        self.next_stream_id
    }

    /// Highest local id handed out so far, 0 if none
    pub fn last_allocated_id(&self) -> StreamId {
        self.next_stream_id.saturating_sub(2)
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_stream_id > MAX_STREAM_ID
    }

    /// Whether `id` has the parity of streams we open
    pub fn is_local(&self, id: StreamId) -> bool {
        (id % 2 == 1) == self.is_client
    }

    /// Whether a local-parity id was already used (and so is not idle)
    pub fn was_allocated(&self, id: StreamId) -> bool {
        self.is_local(id) && id < self.next_stream_id
    }

    pub fn insert(&mut self, id: StreamId, stream: T) {
        self.streams.insert(id, stream);
    }

    pub fn get(&self, id: StreamId) -> Option<&T> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut T> {
        self.streams.get_mut(&id)
    }

    pub fn remove(&mut self, id: StreamId) -> Option<T> {
        self.streams.remove(&id)
    }

    pub fn active_stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&StreamId, &mut T)> {
        self.streams.iter_mut()
    }

    /// Remove and return every stream
    pub fn drain(&mut self) -> Vec<(StreamId, T)> {
        self.streams.drain().collect()
    }

    /// Remove a stream that reached `Closed`, remembering the cause for
    /// [`RESET_GRACE_PERIOD`] so late frames can be judged
    pub fn close(&mut self, id: StreamId, cause: CloseCause, at: Instant) -> Option<T> {
        self.forget_expired(at);
        if self.recently_closed.len() >= MAX_REMEMBERED_CLOSED {
            self.recently_closed.pop_front();
        }
        self.recently_closed.push_back((id, cause, at));
        self.streams.remove(&id)
    }

    /// How `id` closed, if that happened within the grace period
    pub fn closed_cause(&mut self, id: StreamId, now: Instant) -> Option<CloseCause> {
        self.forget_expired(now);
        self.recently_closed
            .iter()
            .rev()
            .find(|&&(closed_id, _, _)| closed_id == id)
            .map(|&(_, cause, _)| cause)
    }

    fn forget_expired(&mut self, now: Instant) {
        while let Some(&(_, _, at)) = self.recently_closed.front() {
            if now.saturating_duration_since(at) <= RESET_GRACE_PERIOD {
                break;
            }
            self.recently_closed.pop_front();
        }
    }
}
