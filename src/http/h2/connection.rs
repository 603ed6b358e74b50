//! The multiplexed HTTP/2 client connection
//!
//! An [`H2Connection`] owns a session split into a read half and a write
//! half. A reader thread decodes every inbound frame and routes it to the
//! stream it belongs to, while callers open streams with
//! [`H2Connection::open_stream`] and write their own HEADERS and DATA.
//!
//! Locking: the writer lock is always taken before the state lock, and the
//! state lock is never held across socket I/O. The reader thread never
//! waits for the writer lock. Control frames it has to send (SETTINGS and
//! PING acknowledgements, WINDOW_UPDATE, RST_STREAM) are queued in the
//! state and written by whoever holds the writer next, or by the reader
//! itself once the lock is free.

use super::codec::{FrameCodec, HeaderBlock, HeaderBlockAssembler};
use super::error::{Error, ErrorCode, Result};
use super::flow_control::{FlowControl, FlowControlWindow, RecvWindow};
use super::frames::{
    DataFrame, Frame, GoawayFrame, ParsedFrame, PingFrame, RstStreamFrame, SettingsFrame,
    WindowUpdateFrame,
};
use super::settings::{PendingSettings, Settings, SettingsBuilder};
use super::stream::{
    recv_after_close, Action, CloseCause, H2Stream, Received, StreamId, StreamManager,
};
use super::{CONNECTION_PREFACE, CONNECTION_STREAM_ID, DEFAULT_INITIAL_WINDOW_SIZE};
use crate::http::headers::CONNECTION_SPECIFIC;
use crate::http::hpack::{Decoder, Encoder, HeaderField, HpackError};
use crate::http::session::{BoxedSession, PollEvents, SessionOps};
use crate::http::{Error as HttpError, Headers, ResponseHead, Status, Version};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often the reader wakes up to check timers when the peer is silent
const READ_TICK: Duration = Duration::from_millis(50);

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Called whenever a stream slot frees up or the connection dies
pub type ReleaseHook = Arc<dyn Fn() + Send + Sync>;

/// Local settings and timers of one connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// SETTINGS_INITIAL_WINDOW_SIZE advertised for every stream
    pub stream_window: u32,
    /// Connection receive window, opened with a WINDOW_UPDATE after the
    /// preface when larger than 65535
    pub connection_window: u32,
    pub max_frame_size: u32,
    pub header_table_size: u32,
    pub max_header_list_size: u32,
    /// Advertised to the peer; a client with push disabled never sees
    /// peer-initiated streams
    pub max_concurrent_streams: u32,
    pub settings_timeout: Duration,
    /// Send a PING after this long without inbound traffic
    pub ping_interval: Option<Duration>,
    pub ping_timeout: Duration,
    /// Close the connection after this long without streams
    pub idle_timeout: Option<Duration>,
    /// How long `open_stream` waits for a concurrency slot; zero fails at once
    pub stream_acquire_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            stream_window: 1 << 20,
            connection_window: 2 << 20,
            max_frame_size: super::DEFAULT_MAX_FRAME_SIZE,
            header_table_size: super::DEFAULT_HEADER_TABLE_SIZE,
            max_header_list_size: 64 * 1024,
            max_concurrent_streams: 100,
            settings_timeout: Duration::from_secs(10),
            ping_interval: None,
            ping_timeout: Duration::from_secs(20),
            idle_timeout: Some(Duration::from_secs(90)),
            stream_acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Something that happened on a stream, in arrival order
#[derive(Debug)]
pub enum StreamEvent {
    /// The final response head; interim (1xx) responses are not delivered
    Headers { head: ResponseHead, end_stream: bool },
    Data { data: Bytes, end_stream: bool },
    /// Trailer section; always the last event
    Trailers(Headers),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvPhase {
    Head,
    Body,
}

struct StreamEntry {
    stream: H2Stream,
    events: Sender<Result<StreamEvent>>,
    phase: RecvPhase,
    is_head: bool,
    content_length: Option<u64>,
    received: u64,
}

struct ConnState {
    streams: StreamManager<StreamEntry>,
    send_window: FlowControlWindow,
    recv_window: RecvWindow,
    remote: Settings,
    local: Settings,
    pending_settings: PendingSettings,
    /// Table size to announce with the next header block
    encoder_table_size: Option<usize>,
    /// Encoded control frames waiting for the writer
    control: BytesMut,
    /// Slots handed out by `reserve_slot` whose HEADERS are not sent yet
    reserved_slots: usize,
    goaway: Option<(u32, ErrorCode)>,
    goaway_sent: bool,
    closing: bool,
    failure: Option<Error>,
    ping: Option<([u8; 8], Instant)>,
    ping_counter: u64,
    last_read: Instant,
    idle_since: Option<Instant>,
    release_hook: Option<ReleaseHook>,
}

impl ConnState {
    /// Whether a new stream may be opened
    fn check_open(&self) -> Result<()> {
        if let Some(failure) = &self.failure {
            return Err(failure.to_connection_failure());
        }
        if let Some((last_stream_id, code)) = self.goaway {
            return Err(Error::GoAway {
                last_stream_id,
                code,
            });
        }
        if self.closing || self.streams.is_exhausted() {
            return Err(Error::NotAccepting);
        }
        Ok(())
    }

    fn in_use(&self) -> usize {
        self.streams.active_stream_count() + self.reserved_slots
    }

    fn stream_limit(&self) -> usize {
        self.remote
            .get_max_concurrent_streams()
            .map_or(usize::MAX, |n| n as usize)
    }

    fn queue_window_update(&mut self, stream_id: StreamId, increment: u32) {
        log::trace!("queue WINDOW_UPDATE stream={} increment={}", stream_id, increment);
        FrameCodec::encode_window_update_frame(
            &WindowUpdateFrame::new(stream_id, increment),
            &mut self.control,
        );
    }

    fn queue_reset(&mut self, stream_id: StreamId, code: ErrorCode) {
        FrameCodec::encode_rst_stream_frame(
            &RstStreamFrame {
                stream_id,
                error_code: code,
            },
            &mut self.control,
        );
    }

    /// The error a stream gets once it is no longer tracked
    fn gone(&self, stream_id: StreamId) -> Error {
        match &self.failure {
            Some(failure) => failure.to_connection_failure(),
            None => Error::stream(stream_id, ErrorCode::StreamClosed, "stream is closed"),
        }
    }
}

struct Writer {
    session: BoxedSession,
    encoder: Encoder,
    buf: BytesMut,
}

struct Shared {
    config: ConnectionConfig,
    writer: Mutex<Writer>,
    state: Mutex<ConnState>,
    /// Signalled when send credit arrives, a stream closes or the
    /// connection fails
    changed: Condvar,
    socket: TcpStream,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ConnState> {
        lock(&self.state)
    }

    fn writer(&self) -> MutexGuard<'_, Writer> {
        lock(&self.writer)
    }

    /// Drop a stream from the table and wake everyone waiting on a slot
    fn close_stream(&self, st: &mut ConnState, id: StreamId, cause: CloseCause) -> Option<StreamEntry> {
        let entry = st.streams.close(id, cause, Instant::now());
        if entry.is_some() {
            log::trace!("stream {} closed ({:?})", id, cause);
            if st.streams.active_stream_count() == 0 {
                st.idle_since = Some(Instant::now());
            }
            self.changed.notify_all();
            if let Some(hook) = &st.release_hook {
                hook();
            }
        }
        entry
    }

    /// Write the queued control frames, then `writer.buf`
    ///
    /// The caller holds the writer lock. A failed write kills the
    /// connection.
    fn send_buffered(&self, writer: &mut Writer) -> Result<()> {
        loop {
            let control = self.state().control.split();
            if control.is_empty() && writer.buf.is_empty() {
                return Ok(());
            }
            let result = writer
                .session
                .write_all(&control)
                .and_then(|()| writer.session.write_all(&writer.buf));
            writer.buf.clear();

            if let Err(e) = result {
                let err = Error::from(e);
                log::debug!("HTTP/2 write failed: {}", err);
                let failure = err.to_connection_failure();
                self.fail(err);
                self.close_socket();
                return Err(failure);
            }
        }
    }

    /// Flush queued control frames unless another thread is writing; that
    /// thread picks them up when it finishes
    fn try_flush_control(&self) -> Result<()> {
        let mut writer = match self.writer.try_lock() {
            Ok(writer) => writer,
            Err(TryLockError::WouldBlock) => return Ok(()),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        if self.state().control.is_empty() {
            return Ok(());
        }
        self.send_buffered(&mut writer)
    }

    fn send_goaway(&self, code: ErrorCode, debug: &str, wait: bool) {
        {
            let mut st = self.state();
            if st.goaway_sent {
                return;
            }
            st.goaway_sent = true;
        }

        let mut frame = BytesMut::new();
        FrameCodec::encode_goaway_frame(
            &GoawayFrame::new(0, code, Bytes::copy_from_slice(debug.as_bytes())),
            &mut frame,
        );
        let writer = if wait {
            Some(self.writer())
        } else {
            match self.writer.try_lock() {
                Ok(writer) => Some(writer),
                Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => None,
            }
        };
        match writer {
            Some(mut writer) => {
                log::debug!("sending GOAWAY {}", code);
                // resets and window updates already queued go out first
                let mut out = self.state().control.split();
                out.extend_from_slice(&frame);
                if let Err(e) = writer.session.write_all(&out) {
                    log::debug!("could not send GOAWAY: {}", e);
                }
            }
            None => log::debug!("writer busy, skipping GOAWAY {}", code),
        }
    }

    /// Mark the connection dead and fail every stream still in flight
    fn fail(&self, err: Error) {
        let mut guard = self.state();
        let st = &mut *guard;
        if st.failure.is_some() {
            return;
        }
        let failure = err.to_connection_failure();
        match &failure {
            Error::ConnectionClosed => log::debug!("HTTP/2 connection closed"),
            _ => log::debug!("HTTP/2 connection failed: {}", err),
        }

        for (_, entry) in st.streams.drain() {
            let _ = entry.events.send(Err(failure.to_connection_failure()));
        }
        st.failure = Some(failure);
        st.control.clear();
        self.changed.notify_all();
        if let Some(hook) = &st.release_hook {
            hook();
        }
    }

    fn close_socket(&self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    /// Wait for a concurrency slot
    fn reserve_slot(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.stream_acquire_timeout;
        let mut st = self.state();
        loop {
            st.check_open()?;
            if st.in_use() < st.stream_limit() {
                st.reserved_slots += 1;
                st.idle_since = None;
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                log::debug!("no stream slot within {:?}", self.config.stream_acquire_timeout);
                return Err(Error::TooManyStreams);
            }
            st = self
                .changed
                .wait_timeout(st, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Block until both windows allow sending part of `wanted` bytes, and
    /// consume that credit
    fn reserve_capacity(&self, id: StreamId, wanted: usize) -> Result<usize> {
        let mut guard = self.state();
        loop {
            let st = &mut *guard;
            if let Some(failure) = &st.failure {
                return Err(failure.to_connection_failure());
            }
            let max_frame = st.remote.get_max_frame_size() as usize;
            let connection_credit = st.send_window.available();
            let gone = st.gone(id);
            let Some(entry) = st.streams.get_mut(id) else {
                return Err(gone);
            };
            if !entry.stream.state().can_send() {
                return Err(Error::stream(id, ErrorCode::StreamClosed, "stream is not writable"));
            }
            if wanted == 0 {
                return Ok(0);
            }

            let n = wanted
                .min(max_frame)
                .min(connection_credit)
                .min(entry.stream.flow.send.available());
            if n > 0 {
                entry.stream.flow.send.consume(n);
                st.send_window.consume(n);
                return Ok(n);
            }

            log::trace!("stream {} waiting for flow-control credit", id);
            guard = self
                .changed
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Hand back credit taken by `reserve_capacity` for data that was
    /// never written
    fn return_capacity(&self, st: &mut ConnState, id: StreamId, n: usize) {
        if n == 0 {
            return;
        }
        let increment = u32::try_from(n).unwrap_or(u32::MAX);
        let _ = st.send_window.increase(increment);
        if let Some(entry) = st.streams.get_mut(id) {
            let _ = entry.stream.flow.send.increase(increment);
        }
        log::trace!("stream {} returned {} bytes of send credit", id, n);
        self.changed.notify_all();
    }

    /// Write one DATA frame whose credit is already reserved
    fn write_data(&self, id: StreamId, data: Bytes, end_stream: bool) -> Result<()> {
        let mut writer = self.writer();
        {
            let mut guard = self.state();
            let st = &mut *guard;
            let gone = st.gone(id);
            let sent = match st.streams.get_mut(id) {
                Some(entry) => entry.stream.send_data(end_stream).map_err(|e| e.into_error(id)),
                None => Err(gone),
            };
            if let Err(e) = sent {
                self.return_capacity(st, id, data.len());
                return Err(e);
            }
            if st.streams.get(id).is_some_and(|entry| entry.stream.state().is_closed()) {
                self.close_stream(st, id, CloseCause::EndStream);
            }
        }
        log::trace!("send DATA stream={} len={} end_stream={}", id, data.len(), end_stream);
        FrameCodec::encode_data_frame(&DataFrame::new(id, data, end_stream), &mut writer.buf);
        self.send_buffered(&mut writer)
    }

    fn write_trailers(&self, id: StreamId, fields: &[HeaderField]) -> Result<()> {
        let mut writer = self.writer();
        let max_frame = {
            let mut guard = self.state();
            let st = &mut *guard;
            let gone = st.gone(id);
            let entry = st.streams.get_mut(id).ok_or(gone)?;
            entry.stream.send_headers(true).map_err(|e| e.into_error(id))?;
            if entry.stream.state().is_closed() {
                self.close_stream(st, id, CloseCause::EndStream);
            }
            if let Some(size) = st.encoder_table_size.take() {
                writer.encoder.set_max_table_size(size);
            }
            st.remote.get_max_frame_size() as usize
        };
        encode_headers(&mut writer, id, fields, true, max_frame);
        self.send_buffered(&mut writer)
    }

    /// RST_STREAM(CANCEL) a stream the caller gave up on
    fn cancel_stream(&self, id: StreamId) {
        {
            let mut guard = self.state();
            let st = &mut *guard;
            let Some(entry) = st.streams.get_mut(id) else {
                return;
            };
            if entry.stream.send_reset() {
                log::debug!("cancelling stream {}", id);
                let _ = entry.events.send(Err(Error::Cancelled(id)));
                st.queue_reset(id, ErrorCode::Cancel);
                self.close_stream(st, id, CloseCause::LocalReset);
            }
        }
        let _ = self.try_flush_control();
    }

    /// Give consumed body bytes back to the peer
    fn release_capacity(&self, id: StreamId, len: usize) {
        if len == 0 {
            return;
        }
        {
            let mut guard = self.state();
            let st = &mut *guard;
            let Some(entry) = st.streams.get_mut(id) else {
                return;
            };
            let len = u32::try_from(len).unwrap_or(u32::MAX);
            if let Some(increment) = entry.stream.flow.recv.release(len) {
                st.queue_window_update(id, increment);
            }
        }
        let _ = self.try_flush_control();
    }

    fn closed_error(&self) -> Error {
        match &self.state().failure {
            Some(failure) => failure.to_connection_failure(),
            None => Error::ConnectionClosed,
        }
    }
}

/// Encode a header list as HEADERS plus CONTINUATION frames into the
/// writer's buffer
fn encode_headers(
    writer: &mut Writer,
    id: StreamId,
    fields: &[HeaderField],
    end_stream: bool,
    max_frame_size: usize,
) {
    let mut block = BytesMut::new();
    writer.encoder.encode(fields, &mut block);
    log::trace!(
        "send HEADERS stream={} block={} bytes end_stream={}",
        id,
        block.len(),
        end_stream
    );
    FrameCodec::encode_header_block(id, &block, end_stream, max_frame_size, &mut writer.buf);
}

/// A client-side HTTP/2 connection
pub struct H2Connection {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl H2Connection {
    /// Run the client side of the connection preface and start the reader
    ///
    /// Sends the preface, our SETTINGS and the connection WINDOW_UPDATE,
    /// then waits up to the settings timeout for the server's SETTINGS,
    /// which it acknowledges.
    pub fn handshake(session: BoxedSession, config: ConnectionConfig) -> Result<H2Connection> {
        let socket = session.try_clone_socket()?;
        let (mut read_half, mut write_half) = session.try_split()?;

        let local = SettingsBuilder::new()
            .enable_push(false)
            .max_concurrent_streams(config.max_concurrent_streams)
            .initial_window_size(config.stream_window)
            .max_frame_size(config.max_frame_size)
            .header_table_size(config.header_table_size)
            .max_header_list_size(config.max_header_list_size)
            .build()?;
        let mut recv_window = RecvWindow::new(DEFAULT_INITIAL_WINDOW_SIZE, config.connection_window);

        let mut preface = BytesMut::with_capacity(128);
        preface.put_slice(CONNECTION_PREFACE);
        FrameCodec::encode_settings_frame(&SettingsFrame::new(local.clone()), &mut preface);
        if let Some(increment) = recv_window.open_to_target() {
            FrameCodec::encode_window_update_frame(
                &WindowUpdateFrame::new(CONNECTION_STREAM_ID, increment),
                &mut preface,
            );
        }
        write_half.write_all(&preface)?;
        let sent_at = Instant::now();

        let mut codec = FrameCodec::new();
        codec.set_max_frame_size(config.max_frame_size as usize);
        let remote = read_server_settings(&mut read_half, &mut codec, config.settings_timeout)?;
        log::debug!("HTTP/2 handshake complete, server settings {:?}", remote);

        let mut encoder = Encoder::new();
        if let Some(size) = remote.header_table_size {
            encoder.set_max_table_size(size as usize);
        }
        let mut ack = BytesMut::new();
        FrameCodec::encode_settings_frame(&SettingsFrame::ack(), &mut ack);
        write_half.write_all(&ack)?;

        let mut pending_settings = PendingSettings::new();
        pending_settings.sent(local, sent_at);
        let now = Instant::now();
        let state = ConnState {
            streams: StreamManager::new(true),
            send_window: FlowControlWindow::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE),
            recv_window,
            remote,
            local: Settings::new(),
            pending_settings,
            encoder_table_size: None,
            control: BytesMut::new(),
            reserved_slots: 0,
            goaway: None,
            goaway_sent: false,
            closing: false,
            failure: None,
            ping: None,
            ping_counter: 0,
            last_read: now,
            idle_since: Some(now),
            release_hook: None,
        };

        let mut decoder = Decoder::new();
        decoder.set_max_allowed_table_size(config.header_table_size as usize);
        decoder.set_max_header_list_size(config.max_header_list_size as usize);
        let assembler = HeaderBlockAssembler::new(config.max_header_list_size as usize);

        let shared = Arc::new(Shared {
            config,
            writer: Mutex::new(Writer {
                session: write_half,
                encoder,
                buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            }),
            state: Mutex::new(state),
            changed: Condvar::new(),
            socket,
        });

        let reader = Reader {
            shared: Arc::clone(&shared),
            session: read_half,
            codec,
            assembler,
            decoder,
            buf: vec![0u8; READ_BUFFER_SIZE],
        };
        let handle = thread::Builder::new()
            .name("h2-reader".to_string())
            .spawn(move || reader.run())?;

        Ok(H2Connection {
            shared,
            reader: Mutex::new(Some(handle)),
        })
    }

    /// Open a stream by sending its request header block
    ///
    /// `fields` must already hold the pseudo-headers. Blocks for a
    /// concurrency slot up to the stream acquire timeout.
    pub fn open_stream(
        &self,
        fields: Vec<HeaderField>,
        end_stream: bool,
    ) -> Result<(SendStream, RecvStream)> {
        let shared = &self.shared;
        shared.reserve_slot()?;

        // ids are allocated under the writer lock so HEADERS go out in id order
        let mut writer = shared.writer();
        let (id, events, max_frame) = {
            let mut st = shared.state();
            st.reserved_slots -= 1;
            if let Err(e) = st.check_open() {
                shared.changed.notify_all();
                return Err(e);
            }
            let id = st.streams.allocate_id()?;

            let window = shared.config.stream_window;
            let mut stream = H2Stream::new(
                id,
                FlowControl::new(st.remote.get_initial_window_size(), window, window),
            );
            stream.send_headers(end_stream).map_err(|e| e.into_error(id))?;
            let is_head = fields
                .iter()
                .any(|f| f.name.as_ref() == b":method" && f.value.as_ref() == b"HEAD");

            let (tx, rx) = mpsc::channel();
            st.streams.insert(
                id,
                StreamEntry {
                    stream,
                    events: tx,
                    phase: RecvPhase::Head,
                    is_head,
                    content_length: None,
                    received: 0,
                },
            );
            st.idle_since = None;
            if let Some(size) = st.encoder_table_size.take() {
                writer.encoder.set_max_table_size(size);
            }
            (id, rx, st.remote.get_max_frame_size() as usize)
        };

        encode_headers(&mut writer, id, &fields, end_stream, max_frame);
        shared.send_buffered(&mut writer)?;
        drop(writer);

        let send = SendStream {
            shared: Arc::clone(shared),
            id,
            finished: end_stream,
        };
        let recv = RecvStream {
            shared: Arc::clone(shared),
            id,
            events,
            finished: false,
        };
        Ok((send, recv))
    }

    /// Install a callback run whenever a stream closes or the connection
    /// dies
    ///
    /// The hook runs with connection state locked and must not call back
    /// into the connection.
    pub fn set_release_hook(&self, hook: ReleaseHook) {
        self.shared.state().release_hook = Some(hook);
    }

    /// Whether new streams can be opened (no failure, GOAWAY or close, ids
    /// left)
    pub fn is_accepting(&self) -> bool {
        self.shared.state().check_open().is_ok()
    }

    /// Accepting, with a free concurrency slot right now
    pub fn has_capacity(&self) -> bool {
        let st = self.shared.state();
        st.check_open().is_ok() && st.in_use() < st.stream_limit()
    }

    /// Streams open or being opened
    pub fn active_streams(&self) -> usize {
        self.shared.state().in_use()
    }

    /// The peer's SETTINGS_MAX_CONCURRENT_STREAMS, `None` for unlimited
    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.shared.state().remote.get_max_concurrent_streams()
    }

    /// Since when the connection has had no streams
    pub fn idle_since(&self) -> Option<Instant> {
        self.shared.state().idle_since
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state().failure.is_some()
    }

    /// Local settings the peer has acknowledged
    pub fn acknowledged_settings(&self) -> Settings {
        self.shared.state().local.clone()
    }

    /// Graceful shutdown: GOAWAY(NO_ERROR), fail what is still in flight,
    /// close the socket and stop the reader
    pub fn close(&self) {
        let already_failed = {
            let mut st = self.shared.state();
            st.closing = true;
            st.failure.is_some()
        };
        if !already_failed {
            self.shared.send_goaway(ErrorCode::NoError, "", true);
        }
        self.shared.fail(Error::ConnectionClosed);
        self.shared.close_socket();

        if let Some(handle) = lock(&self.reader).take() {
            let _ = handle.join();
        }
    }
}

impl Drop for H2Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for H2Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state();
        f.debug_struct("H2Connection")
            .field("active_streams", &st.in_use())
            .field("goaway", &st.goaway)
            .field("failed", &st.failure.is_some())
            .finish()
    }
}

/// Wait for the first frame of the server preface, which must be SETTINGS
fn read_server_settings(
    session: &mut BoxedSession,
    codec: &mut FrameCodec,
    timeout: Duration,
) -> Result<Settings> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 4096];
    loop {
        if let Some(frame) = codec.decode_frame()? {
            return match frame.parse()? {
                ParsedFrame::Settings(settings) if !settings.ack => Ok(settings.settings),
                _ => Err(Error::protocol("server preface does not start with SETTINGS")),
            };
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::SettingsTimeout);
        }
        if !session.poll(PollEvents::Read, Some(deadline - now))? {
            continue;
        }
        match session.read(&mut buf) {
            Ok(0) => return Err(Error::ConnectionClosed),
            Ok(n) => codec.feed(&buf[..n]),
            Err(HttpError::Timeout) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Write half of a stream
pub struct SendStream {
    shared: Arc<Shared>,
    id: StreamId,
    finished: bool,
}

impl SendStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Send request body data, blocking while either flow-control window
    /// is exhausted
    pub fn send_data(&mut self, mut data: Bytes, end_stream: bool) -> Result<()> {
        loop {
            let n = self.shared.reserve_capacity(self.id, data.len())?;
            let chunk = data.split_to(n);
            let last = end_stream && data.is_empty();
            if n > 0 || last {
                self.shared.write_data(self.id, chunk, last)?;
            }
            if data.is_empty() {
                break;
            }
        }
        if end_stream {
            self.finished = true;
        }
        Ok(())
    }

    /// End the request with a trailer section
    pub fn send_trailers(&mut self, fields: Vec<HeaderField>) -> Result<()> {
        self.shared.write_trailers(self.id, &fields)?;
        self.finished = true;
        Ok(())
    }

    pub fn cancel(&mut self) {
        self.finished = true;
        self.shared.cancel_stream(self.id);
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for SendStream {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.cancel_stream(self.id);
        }
    }
}

/// Read half of a stream
pub struct RecvStream {
    shared: Arc<Shared>,
    id: StreamId,
    events: Receiver<Result<StreamEvent>>,
    finished: bool,
}

impl RecvStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Next event of the stream
    ///
    /// `None` waits as long as it takes. On expiry of `timeout` the stream
    /// stays usable and [`Error::Timeout`] is returned.
    pub fn recv(&mut self, timeout: Option<Duration>) -> Result<StreamEvent> {
        if self.finished {
            return Err(Error::stream(self.id, ErrorCode::StreamClosed, "stream already ended"));
        }
        let event = match timeout {
            Some(timeout) => match self.events.recv_timeout(timeout) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => return Err(Error::Timeout),
                Err(RecvTimeoutError::Disconnected) => Err(self.shared.closed_error()),
            },
            None => self
                .events
                .recv()
                .unwrap_or_else(|_| Err(self.shared.closed_error())),
        };

        self.finished = match &event {
            Ok(StreamEvent::Headers { end_stream, .. }) | Ok(StreamEvent::Data { end_stream, .. }) => {
                *end_stream
            }
            Ok(StreamEvent::Trailers(_)) | Err(_) => true,
        };
        event
    }

    /// Return window credit for `len` consumed body bytes
    pub fn release_capacity(&self, len: usize) {
        self.shared.release_capacity(self.id, len);
    }

    /// Reset the stream with CANCEL
    pub fn cancel(&mut self) {
        if !self.finished {
            self.finished = true;
            self.shared.cancel_stream(self.id);
        }
    }

    /// A handle that cancels this stream from any thread
    pub fn canceller(&self) -> Canceller {
        Canceller {
            shared: Arc::downgrade(&self.shared),
            id: self.id,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for RecvStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Cancels one stream; a no-op once the stream or connection is gone
#[derive(Clone)]
pub struct Canceller {
    shared: Weak<Shared>,
    id: StreamId,
}

impl Canceller {
    pub fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.cancel_stream(self.id);
        }
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller").field("stream_id", &self.id).finish()
    }
}

/// The reader thread: sole owner of the read half, the HPACK decoder and
/// the header block assembler
struct Reader {
    shared: Arc<Shared>,
    session: BoxedSession,
    codec: FrameCodec,
    assembler: HeaderBlockAssembler,
    decoder: Decoder,
    buf: Vec<u8>,
}

impl Reader {
    fn run(mut self) {
        let (goaway, err) = match self.read_loop() {
            Ok(()) => (Some(ErrorCode::NoError), Error::ConnectionClosed),
            // nothing can be sent on a broken socket
            Err(e @ (Error::Io(_) | Error::Http(_) | Error::ConnectionClosed)) => (None, e),
            Err(e) => {
                log::warn!("HTTP/2 connection error: {}", e);
                (Some(e.code()), e)
            }
        };
        if let Some(code) = goaway {
            let debug = if code == ErrorCode::NoError { String::new() } else { err.to_string() };
            self.shared.send_goaway(code, &debug, false);
        }
        self.shared.fail(err);
        self.shared.close_socket();
    }

    fn read_loop(&mut self) -> Result<()> {
        loop {
            self.drain_frames()?;
            if !self.tick(Instant::now())? {
                return Ok(());
            }
            self.shared.try_flush_control()?;

            if !self.session.poll(PollEvents::Read, Some(READ_TICK))? {
                continue;
            }
            let n = match self.session.read(&mut self.buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => n,
                Err(HttpError::Timeout) => continue,
                Err(e) => return Err(e.into()),
            };
            self.shared.state().last_read = Instant::now();
            self.codec.feed(&self.buf[..n]);
        }
    }

    /// Process every complete frame in the read buffer
    fn drain_frames(&mut self) -> Result<()> {
        while let Some(frame) = self.codec.decode_frame()? {
            self.assembler.check_sequence(&frame)?;
            log::trace!(
                "recv {} stream={} flags=0x{:02x} len={}",
                frame.frame_type().map_or("UNKNOWN", |t| t.name()),
                frame.stream_id,
                frame.flags.as_u8(),
                frame.payload_len()
            );
            if let Err(err) = self.handle_frame(frame) {
                if err.is_connection_error() {
                    return Err(err);
                }
                self.reset_for_error(err);
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame.parse()? {
            ParsedFrame::Data(frame) => self.on_data(frame),
            ParsedFrame::Headers(frame) => match self.assembler.headers(frame)? {
                Some(block) => self.on_header_block(block),
                None => Ok(()),
            },
            ParsedFrame::Continuation(frame) => match self.assembler.continuation(frame)? {
                Some(block) => self.on_header_block(block),
                None => Ok(()),
            },
            ParsedFrame::PushPromise(_) => {
                Err(Error::protocol("PUSH_PROMISE received with push disabled"))
            }
            ParsedFrame::RstStream(frame) => self.on_reset(frame),
            ParsedFrame::Settings(frame) => self.on_settings(frame),
            ParsedFrame::Ping(frame) => self.on_ping(frame),
            ParsedFrame::Goaway(frame) => self.on_goaway(frame),
            ParsedFrame::WindowUpdate(frame) => self.on_window_update(frame),
            ParsedFrame::Priority(_) | ParsedFrame::Unknown { .. } => Ok(()),
        }
    }

    /// Answer a stream error with RST_STREAM and hand it to the stream's
    /// reader
    fn reset_for_error(&mut self, err: Error) {
        let (id, code) = match &err {
            Error::Stream {
                stream_id, code, ..
            } => (*stream_id, *code),
            other => {
                log::debug!("ignoring {}", other);
                return;
            }
        };
        log::warn!("{}", err);

        let mut guard = self.shared.state();
        let st = &mut *guard;
        st.queue_reset(id, code);
        if let Some(entry) = st.streams.get_mut(id) {
            entry.stream.send_reset();
            let _ = entry.events.send(Err(err));
            self.shared.close_stream(st, id, CloseCause::LocalReset);
        }
    }

    fn on_data(&mut self, frame: DataFrame) -> Result<()> {
        let id = frame.stream_id;
        let mut guard = self.shared.state();
        let st = &mut *guard;

        // the connection window is charged even for streams we dropped,
        // and credited right away
        st.recv_window.receive(frame.flow_len)?;
        if let Some(increment) = st.recv_window.release(frame.flow_len) {
            st.queue_window_update(CONNECTION_STREAM_ID, increment);
        }

        let Some(entry) = st.streams.get_mut(id) else {
            return untracked_frame(st, id, Action::RecvData);
        };
        match entry.stream.recv_data(frame.end_stream) {
            Ok(Received::Accept) => {}
            Ok(Received::Ignore) => return Ok(()),
            Err(e) => return Err(e.into_error(id)),
        }
        if entry.phase == RecvPhase::Head {
            return Err(Error::stream(id, ErrorCode::ProtocolError, "DATA before response HEADERS"));
        }
        if let Err(e) = entry.stream.flow.recv.receive(frame.flow_len) {
            return Err(Error::stream(id, ErrorCode::FlowControlError, e.to_string()));
        }

        entry.received += frame.data.len() as u64;
        if let Some(expected) = entry.content_length {
            if entry.received > expected || (frame.end_stream && entry.received != expected) {
                return Err(Error::stream(
                    id,
                    ErrorCode::ProtocolError,
                    format!("body length does not match content-length {}", expected),
                ));
            }
        }

        // padding is never handed to the caller, so its credit returns now
        let padding = frame.flow_len - frame.data.len() as u32;
        let padding_credit = if padding > 0 {
            entry.stream.flow.recv.release(padding)
        } else {
            None
        };
        let closed = entry.stream.state().is_closed();
        let _ = entry.events.send(Ok(StreamEvent::Data {
            data: frame.data,
            end_stream: frame.end_stream,
        }));

        if let Some(increment) = padding_credit {
            st.queue_window_update(id, increment);
        }
        if closed {
            self.shared.close_stream(st, id, CloseCause::EndStream);
        }
        Ok(())
    }

    fn on_header_block(&mut self, block: HeaderBlock) -> Result<()> {
        let id = block.stream_id;
        // decoded even for unknown streams to keep the table in sync
        let fields = match self.decoder.decode(&block.block) {
            Ok(fields) => fields,
            Err(HpackError::HeaderListTooLarge(limit)) => {
                return Err(Error::stream(
                    id,
                    ErrorCode::ProtocolError,
                    format!("header list exceeds {} bytes", limit),
                ));
            }
            Err(e) => return Err(Error::Compression(e)),
        };

        let mut guard = self.shared.state();
        let st = &mut *guard;
        let Some(entry) = st.streams.get_mut(id) else {
            return untracked_frame(st, id, Action::RecvHeaders);
        };
        match entry.stream.recv_headers(block.end_stream) {
            Ok(Received::Accept) => {}
            Ok(Received::Ignore) => return Ok(()),
            Err(e) => return Err(e.into_error(id)),
        }
        let malformed = |reason: String| Error::stream(id, ErrorCode::ProtocolError, reason);

        let event = match entry.phase {
            RecvPhase::Head => {
                let (status, headers) = response_head(&fields).map_err(malformed)?;
                if status.is_informational() {
                    if block.end_stream || status.code() == 101 {
                        return Err(malformed(format!("invalid interim response {}", status.code())));
                    }
                    log::trace!("stream {} interim response {}", id, status.code());
                    return Ok(());
                }
                let head = ResponseHead::new(Version::Http2, status, headers);
                let content_length = head
                    .content_length()
                    .map_err(|e| malformed(e.to_string()))?;
                // HEAD, 204 and 304 carry no body whatever the length says
                if !entry.is_head && !matches!(status.code(), 204 | 304) {
                    entry.content_length = content_length;
                }
                if block.end_stream && entry.content_length.is_some_and(|n| n > 0) {
                    return Err(malformed("END_STREAM on HEADERS with a non-zero content-length".into()));
                }
                entry.phase = RecvPhase::Body;
                StreamEvent::Headers {
                    head,
                    end_stream: block.end_stream,
                }
            }
            RecvPhase::Body => {
                if !block.end_stream {
                    return Err(malformed("trailers without END_STREAM".into()));
                }
                let trailers = trailer_section(&fields).map_err(malformed)?;
                if let Some(expected) = entry.content_length {
                    if entry.received != expected {
                        return Err(malformed(format!(
                            "body length {} does not match content-length {}",
                            entry.received, expected
                        )));
                    }
                }
                StreamEvent::Trailers(trailers)
            }
        };

        let closed = entry.stream.state().is_closed();
        let _ = entry.events.send(Ok(event));
        if closed {
            self.shared.close_stream(st, id, CloseCause::EndStream);
        }
        Ok(())
    }

    fn on_reset(&mut self, frame: RstStreamFrame) -> Result<()> {
        let id = frame.stream_id;
        let mut guard = self.shared.state();
        let st = &mut *guard;
        let Some(entry) = st.streams.get_mut(id) else {
            if st.streams.was_allocated(id) {
                return Ok(());
            }
            return Err(Error::protocol(format!("RST_STREAM on idle stream {}", id)));
        };
        match entry.stream.recv_reset() {
            Ok(Received::Accept) => {}
            Ok(Received::Ignore) => return Ok(()),
            Err(e) => return Err(e.into_error(id)),
        }

        log::debug!("stream {} reset by peer: {}", id, frame.error_code);
        let _ = entry.events.send(Err(Error::Reset {
            stream_id: id,
            code: frame.error_code,
        }));
        self.shared.close_stream(st, id, CloseCause::RemoteReset);
        Ok(())
    }

    fn on_settings(&mut self, frame: SettingsFrame) -> Result<()> {
        let mut guard = self.shared.state();
        let st = &mut *guard;

        if frame.ack {
            match st.pending_settings.acknowledged() {
                Some(local) => {
                    log::trace!("SETTINGS acknowledged");
                    st.local.merge(&local);
                }
                None => log::warn!("unsolicited SETTINGS ACK"),
            }
            return Ok(());
        }

        let settings = frame.settings;
        settings.validate()?;
        if let Some(window) = settings.initial_window_size {
            for (_, entry) in st.streams.iter_mut() {
                entry.stream.flow.send.update_initial_size(window)?;
            }
        }
        if let Some(size) = settings.header_table_size {
            st.encoder_table_size = Some(size as usize);
        }
        log::debug!("peer settings update {:?}", settings);
        st.remote.merge(&settings);

        FrameCodec::encode_settings_frame(&SettingsFrame::ack(), &mut st.control);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn on_ping(&mut self, frame: PingFrame) -> Result<()> {
        let mut st = self.shared.state();
        if !frame.ack {
            FrameCodec::encode_ping_frame(&PingFrame::ack(frame.data), &mut st.control);
            return Ok(());
        }
        let outstanding = st.ping;
        match outstanding {
            Some((data, sent)) if data == frame.data => {
                log::trace!("PING round trip {:?}", sent.elapsed());
                st.ping = None;
            }
            _ => log::debug!("PING ACK with unknown payload {:?}", frame.data),
        }
        Ok(())
    }

    fn on_goaway(&mut self, frame: GoawayFrame) -> Result<()> {
        let mut guard = self.shared.state();
        let st = &mut *guard;
        let last_stream_id = match st.goaway {
            Some((previous, _)) => previous.min(frame.last_stream_id),
            None => frame.last_stream_id,
        };
        log::debug!(
            "GOAWAY received: last stream {}, {} {:?}",
            frame.last_stream_id,
            frame.error_code,
            String::from_utf8_lossy(&frame.debug_data)
        );
        st.goaway = Some((last_stream_id, frame.error_code));

        for id in st.streams.stream_ids() {
            if id <= last_stream_id {
                continue;
            }
            // never processed by the peer; ignore anything late for it
            if let Some(entry) = self.shared.close_stream(st, id, CloseCause::LocalReset) {
                let _ = entry.events.send(Err(Error::GoAway {
                    last_stream_id,
                    code: frame.error_code,
                }));
            }
        }
        self.shared.changed.notify_all();
        Ok(())
    }

    fn on_window_update(&mut self, frame: WindowUpdateFrame) -> Result<()> {
        let id = frame.stream_id;
        if frame.size_increment == 0 {
            if id == CONNECTION_STREAM_ID {
                return Err(Error::protocol("connection WINDOW_UPDATE with zero increment"));
            }
            return Err(Error::stream(id, ErrorCode::ProtocolError, "WINDOW_UPDATE with zero increment"));
        }

        let mut guard = self.shared.state();
        let st = &mut *guard;
        if id == CONNECTION_STREAM_ID {
            st.send_window.increase(frame.size_increment)?;
        } else if let Some(entry) = st.streams.get_mut(id) {
            if entry.stream.recv_window_update().map_err(|e| e.into_error(id))? == Received::Ignore {
                return Ok(());
            }
            if let Err(e) = entry.stream.flow.send.increase(frame.size_increment) {
                return Err(Error::stream(id, ErrorCode::FlowControlError, e.to_string()));
            }
        } else if !st.streams.was_allocated(id) {
            return Err(Error::protocol(format!("WINDOW_UPDATE on idle stream {}", id)));
        }
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Settings, PING and idle timers; false ends the connection gracefully
    fn tick(&mut self, now: Instant) -> Result<bool> {
        let config = &self.shared.config;
        let mut st = self.shared.state();
        if st.closing || st.failure.is_some() {
            return Ok(false);
        }
        if st.pending_settings.is_overdue(now, config.settings_timeout) {
            return Err(Error::SettingsTimeout);
        }

        if let Some(interval) = config.ping_interval {
            let outstanding = st.ping;
            match outstanding {
                Some((_, sent)) if now.saturating_duration_since(sent) > config.ping_timeout => {
                    return Err(Error::ConnectionFailed {
                        code: ErrorCode::NoError,
                        reason: format!("no PING acknowledgement within {:?}", config.ping_timeout),
                    });
                }
                Some(_) => {}
                None if now.saturating_duration_since(st.last_read) >= interval => {
                    st.ping_counter += 1;
                    let data = st.ping_counter.to_be_bytes();
                    log::trace!("sending keepalive PING {}", st.ping_counter);
                    FrameCodec::encode_ping_frame(&PingFrame::new(data), &mut st.control);
                    st.ping = Some((data, now));
                }
                None => {}
            }
        }

        let unused = st.in_use() == 0;
        if let (Some(idle), Some(since), true) = (config.idle_timeout, st.idle_since, unused) {
            if now.saturating_duration_since(since) >= idle
                && now.saturating_duration_since(st.last_read) >= idle
            {
                log::debug!("closing HTTP/2 connection idle for {:?}", idle);
                st.closing = true;
                return Ok(false);
            }
        }
        if st.goaway.is_some() && unused {
            log::debug!("GOAWAY received and no streams left, closing");
            st.closing = true;
            return Ok(false);
        }
        Ok(true)
    }
}

/// HEADERS or DATA for a stream that is not in the table
fn untracked_frame(st: &mut ConnState, id: StreamId, action: Action) -> Result<()> {
    if let Some(cause) = st.streams.closed_cause(id, Instant::now()) {
        return recv_after_close(cause, action)
            .map(|_| ())
            .map_err(|e| e.into_error(id));
    }
    if st.streams.was_allocated(id) {
        return Err(Error::ConnectionFailed {
            code: ErrorCode::StreamClosed,
            reason: format!("{:?} on closed stream {}", action, id),
        });
    }
    Err(Error::protocol(format!("{:?} on idle stream {}", action, id)))
}

/// Turn a regular field into a header, rejecting what HTTP/2 forbids
fn regular_field(field: &HeaderField) -> std::result::Result<(String, String), String> {
    let name = field
        .name_str()
        .ok_or_else(|| "header name is not valid UTF-8".to_string())?;
    if name.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(format!("uppercase header name {:?}", name));
    }
    if name != "host" && CONNECTION_SPECIFIC.contains(&name) {
        return Err(format!("connection-specific header {:?}", name));
    }
    Ok((name.to_string(), String::from_utf8_lossy(&field.value).into_owned()))
}

/// Validate a response header list: `:status` first and exactly once, no
/// other pseudo-headers
fn response_head(fields: &[HeaderField]) -> std::result::Result<(Status, Headers), String> {
    let mut status = None;
    let mut headers = Headers::new();
    for field in fields {
        if field.is_pseudo() {
            if !headers.is_empty() {
                return Err("pseudo-header after a regular header".to_string());
            }
            if field.name.as_ref() != b":status" {
                return Err(format!(
                    "unexpected pseudo-header {}",
                    String::from_utf8_lossy(&field.name)
                ));
            }
            if status.is_some() {
                return Err("duplicate :status".to_string());
            }
            status = Some(Status::from_bytes(&field.value).map_err(|e| e.to_string())?);
        } else {
            let (name, value) = regular_field(field)?;
            headers.insert(name, value);
        }
    }
    let status = status.ok_or_else(|| "missing :status".to_string())?;
    Ok((status, headers))
}

fn trailer_section(fields: &[HeaderField]) -> std::result::Result<Headers, String> {
    let mut trailers = Headers::new();
    for field in fields {
        if field.is_pseudo() {
            return Err("pseudo-header in trailers".to_string());
        }
        let (name, value) = regular_field(field)?;
        trailers.insert(name, value);
    }
    Ok(trailers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::FrameType;
    use crate::http::session::FdSessionOps;

    fn fields(list: &[(&'static str, &'static str)]) -> Vec<HeaderField> {
        list.iter().map(|&(n, v)| HeaderField::new(n, v)).collect()
    }

    #[test]
    fn test_response_head() {
        let (status, headers) =
            response_head(&fields(&[(":status", "200"), ("content-type", "text/plain")])).unwrap();
        assert_eq!(status, Status::OK);
        assert_eq!(headers.get("content-type"), Some("text/plain"));
    }

    #[test]
    fn test_response_head_rejects_malformed_lists() {
        assert!(response_head(&fields(&[("content-type", "text/plain")])).is_err());
        assert!(response_head(&fields(&[(":status", "200"), (":status", "204")])).is_err());
        assert!(response_head(&fields(&[("a", "1"), (":status", "200")])).is_err());
        assert!(response_head(&fields(&[(":status", "200"), (":path", "/")])).is_err());
        assert!(response_head(&fields(&[(":status", "2000")])).is_err());
        assert!(response_head(&fields(&[(":status", "200"), ("Content-Type", "x")])).is_err());
        assert!(response_head(&fields(&[(":status", "200"), ("connection", "close")])).is_err());
    }

    #[test]
    fn test_trailer_section() {
        let trailers = trailer_section(&fields(&[("grpc-status", "0")])).unwrap();
        assert_eq!(trailers.get("grpc-status"), Some("0"));
        assert!(trailer_section(&fields(&[(":status", "200")])).is_err());
    }

    fn conn_state() -> ConnState {
        ConnState {
            streams: StreamManager::new(true),
            send_window: FlowControlWindow::new(),
            recv_window: RecvWindow::new(65535, 65535),
            remote: Settings::new(),
            local: Settings::new(),
            pending_settings: PendingSettings::new(),
            encoder_table_size: None,
            control: BytesMut::new(),
            reserved_slots: 0,
            goaway: None,
            goaway_sent: false,
            closing: false,
            failure: None,
            ping: None,
            ping_counter: 0,
            last_read: Instant::now(),
            idle_since: None,
            release_hook: None,
        }
    }

    /// A connection without a reader thread; the peer end is returned so
    /// writes have somewhere to go
    fn bare_connection() -> (Shared, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (peer, _) = listener.accept().unwrap();
        let shared = Shared {
            config: ConnectionConfig::default(),
            writer: Mutex::new(Writer {
                session: Box::new(FdSessionOps::new(client.try_clone().unwrap())),
                encoder: Encoder::new(),
                buf: BytesMut::new(),
            }),
            state: Mutex::new(conn_state()),
            changed: Condvar::new(),
            socket: client,
        };
        (shared, peer)
    }

    fn open_upload(shared: &Shared) -> StreamId {
        let mut st = shared.state();
        let id = st.streams.allocate_id().unwrap();
        let mut stream = H2Stream::new(id, FlowControl::new(65535, 65535, 65535));
        stream.send_headers(false).unwrap();
        let (tx, _) = mpsc::channel();
        st.streams.insert(
            id,
            StreamEntry {
                stream,
                events: tx,
                phase: RecvPhase::Head,
                is_head: false,
                content_length: None,
                received: 0,
            },
        );
        id
    }

    #[test]
    fn test_unwritten_data_returns_credit() {
        let (shared, _peer) = bare_connection();

        // reset between reserving credit and writing the frame
        let id = open_upload(&shared);
        let n = shared.reserve_capacity(id, 100_000).unwrap();
        assert_eq!(n, 16_384);
        assert_eq!(shared.state().send_window.available(), 65_535 - n);
        shared.cancel_stream(id);
        assert!(shared.write_data(id, Bytes::from(vec![0u8; n]), false).is_err());
        assert_eq!(shared.state().send_window.available(), 65_535);

        // the stream stops being writable after the reservation
        let id = open_upload(&shared);
        let n = shared.reserve_capacity(id, 1000).unwrap();
        assert_eq!(n, 1000);
        shared
            .state()
            .streams
            .get_mut(id)
            .unwrap()
            .stream
            .send_data(true)
            .unwrap();
        let err = shared.write_data(id, Bytes::from(vec![0u8; n]), false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StreamClosed);
        let st = shared.state();
        assert_eq!(st.send_window.available(), 65_535);
        assert_eq!(st.streams.get(id).unwrap().stream.flow.send.available(), 65_535);
    }

    #[test]
    fn test_goaway_follows_queued_control_frames() {
        let (shared, mut peer) = bare_connection();
        shared.state().queue_reset(1, ErrorCode::Cancel);
        shared.state().queue_window_update(0, 1000);
        shared.send_goaway(ErrorCode::NoError, "", true);
        shared.fail(Error::ConnectionClosed);
        shared.close_socket();

        let mut codec = FrameCodec::new();
        let mut types = Vec::new();
        while let Ok(frame) = codec.read_frame(&mut peer) {
            types.push(frame.frame_type());
        }
        assert_eq!(
            types,
            vec![
                Some(FrameType::RstStream),
                Some(FrameType::WindowUpdate),
                Some(FrameType::Goaway),
            ]
        );
    }

    #[test]
    fn test_untracked_frames() {
        let mut st = conn_state();
        let reset = st.streams.allocate_id().unwrap();
        let ended = st.streams.allocate_id().unwrap();
        let forgotten = st.streams.allocate_id().unwrap();
        st.streams.close(reset, CloseCause::LocalReset, Instant::now());
        st.streams.close(ended, CloseCause::EndStream, Instant::now());

        assert!(untracked_frame(&mut st, reset, Action::RecvData).is_ok());
        let err = untracked_frame(&mut st, ended, Action::RecvData).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StreamClosed);
        assert!(err.is_connection_error());
        assert!(untracked_frame(&mut st, forgotten, Action::RecvHeaders).is_err());

        let err = untracked_frame(&mut st, 2, Action::RecvHeaders).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);

        assert!(st.check_open().is_ok());
        st.goaway = Some((1, ErrorCode::NoError));
        assert!(st.check_open().unwrap_err().is_refused());
    }
}
