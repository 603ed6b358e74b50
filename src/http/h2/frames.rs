//! HTTP/2 frame types and utilities
//!
//! This module defines the frame types specified in RFC 9113 Section 6, and
//! turns a raw [`Frame`] into a typed [`ParsedFrame`] while enforcing the
//! per-type payload rules.

use super::error::{Error, ErrorCode, Result};
use super::settings::Settings;
use bytes::{Buf, Bytes};
use std::fmt;

/// HTTP/2 frame types (RFC 9113 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// DATA frame (0x0) - Conveys arbitrary, variable-length sequences of octets
    Data = 0x0,
    /// HEADERS frame (0x1) - Opens a stream and carries header block fragment
    Headers = 0x1,
    /// PRIORITY frame (0x2) - Deprecated priority signal, parsed and ignored
    Priority = 0x2,
    /// RST_STREAM frame (0x3) - Allows immediate termination of a stream
    RstStream = 0x3,
    /// SETTINGS frame (0x4) - Conveys configuration parameters
    Settings = 0x4,
    /// PUSH_PROMISE frame (0x5) - Rejected, push is always disabled
    PushPromise = 0x5,
    /// PING frame (0x6) - Liveness check and round-trip measurement
    Ping = 0x6,
    /// GOAWAY frame (0x7) - Initiates shutdown of connection
    Goaway = 0x7,
    /// WINDOW_UPDATE frame (0x8) - Implements flow control
    WindowUpdate = 0x8,
    /// CONTINUATION frame (0x9) - Continues sequence of header block fragments
    Continuation = 0x9,
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::Goaway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u8())
    }
}

/// HTTP/2 frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Builder-style [`FrameFlags::set`] when `cond` holds
    pub fn with(mut self, flag: u8, cond: bool) -> Self {
        if cond {
            self.set(flag);
        }
        self
    }

    pub fn is_set(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    /// END_STREAM flag (0x1)
    pub const END_STREAM: u8 = 0x1;

    /// ACK flag (0x1) - used for SETTINGS and PING
    pub const ACK: u8 = 0x1;

    /// END_HEADERS flag (0x4)
    pub const END_HEADERS: u8 = 0x4;

    /// PADDED flag (0x8)
    pub const PADDED: u8 = 0x8;

    /// PRIORITY flag (0x20)
    pub const PRIORITY: u8 = 0x20;

    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// A frame as read off the wire: header fields plus an unparsed payload
///
/// `kind` is the raw type byte so that frames of unknown types can be
/// carried (and ignored) without losing their position in the sequence.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: u8,
    pub flags: FrameFlags,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, flags: FrameFlags, stream_id: u32, payload: Bytes) -> Self {
        Frame {
            kind: frame_type.as_u8(),
            flags,
            stream_id,
            payload,
        }
    }

    /// `None` for frame types this implementation does not know
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.kind)
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Validate the payload against the rules for this frame type
    pub fn parse(self) -> Result<ParsedFrame> {
        let Some(frame_type) = self.frame_type() else {
            return Ok(ParsedFrame::Unknown {
                kind: self.kind,
                stream_id: self.stream_id,
            });
        };

        let stream_id = self.stream_id;
        let flags = self.flags;
        let flow_len = self.payload.len() as u32;

        match frame_type {
            FrameType::Data => {
                require_stream(frame_type, stream_id)?;
                let data = strip_padding(frame_type, flags, self.payload)?;
                Ok(ParsedFrame::Data(DataFrame {
                    stream_id,
                    data,
                    end_stream: flags.is_end_stream(),
                    flow_len,
                }))
            }
            FrameType::Headers => {
                require_stream(frame_type, stream_id)?;
                let mut block = strip_padding(frame_type, flags, self.payload)?;
                let priority = if flags.is_priority() {
                    if block.len() < 5 {
                        return Err(Error::FrameSize("HEADERS priority fields truncated".into()));
                    }
                    let spec = PrioritySpec::decode(&block[..5]);
                    block.advance(5);
                    Some(spec)
                } else {
                    None
                };
                Ok(ParsedFrame::Headers(HeadersFrame {
                    stream_id,
                    header_block: block,
                    end_stream: flags.is_end_stream(),
                    end_headers: flags.is_end_headers(),
                    priority,
                }))
            }
            FrameType::Priority => {
                require_stream(frame_type, stream_id)?;
                if self.payload.len() != 5 {
                    return Err(Error::stream(
                        stream_id,
                        ErrorCode::FrameSizeError,
                        "PRIORITY payload must be 5 bytes",
                    ));
                }
                Ok(ParsedFrame::Priority(PriorityFrame {
                    stream_id,
                    priority: PrioritySpec::decode(&self.payload),
                }))
            }
            FrameType::RstStream => {
                require_stream(frame_type, stream_id)?;
                require_len(frame_type, &self.payload, 4)?;
                let code = (&self.payload[..]).get_u32();
                Ok(ParsedFrame::RstStream(RstStreamFrame {
                    stream_id,
                    error_code: ErrorCode::from_wire(code),
                }))
            }
            FrameType::Settings => {
                require_connection(frame_type, stream_id)?;
                if flags.is_ack() {
                    if !self.payload.is_empty() {
                        return Err(Error::FrameSize("SETTINGS ACK with a payload".into()));
                    }
                    return Ok(ParsedFrame::Settings(SettingsFrame::ack()));
                }
                let settings = Settings::decode(&self.payload)?;
                Ok(ParsedFrame::Settings(SettingsFrame::new(settings)))
            }
            FrameType::PushPromise => {
                require_stream(frame_type, stream_id)?;
                let mut block = strip_padding(frame_type, flags, self.payload)?;
                if block.len() < 4 {
                    return Err(Error::FrameSize("PUSH_PROMISE truncated".into()));
                }
                let promised_stream_id = block.get_u32() & 0x7FFF_FFFF;
                Ok(ParsedFrame::PushPromise(PushPromiseFrame {
                    stream_id,
                    promised_stream_id,
                    header_block: block,
                    end_headers: flags.is_end_headers(),
                }))
            }
            FrameType::Ping => {
                require_connection(frame_type, stream_id)?;
                require_len(frame_type, &self.payload, 8)?;
                let mut data = [0u8; 8];
                data.copy_from_slice(&self.payload);
                Ok(ParsedFrame::Ping(PingFrame {
                    ack: flags.is_ack(),
                    data,
                }))
            }
            FrameType::Goaway => {
                require_connection(frame_type, stream_id)?;
                if self.payload.len() < 8 {
                    return Err(Error::FrameSize("GOAWAY payload shorter than 8 bytes".into()));
                }
                let mut payload = self.payload;
                let last_stream_id = payload.get_u32() & 0x7FFF_FFFF;
                let error_code = ErrorCode::from_wire(payload.get_u32());
                Ok(ParsedFrame::Goaway(GoawayFrame {
                    last_stream_id,
                    error_code,
                    debug_data: payload,
                }))
            }
            FrameType::WindowUpdate => {
                require_len(frame_type, &self.payload, 4)?;
                let size_increment = (&self.payload[..]).get_u32() & 0x7FFF_FFFF;
                Ok(ParsedFrame::WindowUpdate(WindowUpdateFrame {
                    stream_id,
                    size_increment,
                }))
            }
            FrameType::Continuation => {
                require_stream(frame_type, stream_id)?;
                Ok(ParsedFrame::Continuation(ContinuationFrame {
                    stream_id,
                    header_block: self.payload,
                    end_headers: flags.is_end_headers(),
                }))
            }
        }
    }
}

fn require_stream(frame_type: FrameType, stream_id: u32) -> Result<()> {
    if stream_id == 0 {
        return Err(Error::protocol(format!("{} on stream 0", frame_type.name())));
    }
    Ok(())
}

fn require_connection(frame_type: FrameType, stream_id: u32) -> Result<()> {
    if stream_id != 0 {
        return Err(Error::protocol(format!(
            "{} on stream {}",
            frame_type.name(),
            stream_id
        )));
    }
    Ok(())
}

fn require_len(frame_type: FrameType, payload: &[u8], len: usize) -> Result<()> {
    if payload.len() != len {
        return Err(Error::FrameSize(format!(
            "{} payload is {} bytes, expected {}",
            frame_type.name(),
            payload.len(),
            len
        )));
    }
    Ok(())
}

/// Remove the pad length byte and trailing padding when PADDED is set
fn strip_padding(frame_type: FrameType, flags: FrameFlags, mut payload: Bytes) -> Result<Bytes> {
    if !flags.is_padded() {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(Error::FrameSize(format!("padded {} without pad length", frame_type.name())));
    }
    let pad_len = payload.get_u8() as usize;
    if pad_len > payload.len() {
        return Err(Error::protocol(format!(
            "{} padding exceeds payload",
            frame_type.name()
        )));
    }
    payload.truncate(payload.len() - pad_len);
    Ok(payload)
}

/// A frame with a validated, typed payload
#[derive(Debug, Clone)]
pub enum ParsedFrame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    PushPromise(PushPromiseFrame),
    Ping(PingFrame),
    Goaway(GoawayFrame),
    WindowUpdate(WindowUpdateFrame),
    Continuation(ContinuationFrame),
    /// Frame type without a definition here; must be ignored
    Unknown { kind: u8, stream_id: u32 },
}

/// DATA frame (RFC 9113 Section 6.1)
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: u32,
    /// Payload with any padding removed
    pub data: Bytes,
    pub end_stream: bool,
    /// Bytes counted against flow control, padding included
    pub flow_len: u32,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        let flow_len = data.len() as u32;
        DataFrame {
            stream_id,
            data,
            end_stream,
            flow_len,
        }
    }
}

/// HEADERS frame (RFC 9113 Section 6.2)
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: u32,
    /// Header block fragment
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<PrioritySpec>,
}

/// Stream dependency and weight (RFC 9113 Section 5.3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub stream_dependency: u32,
    pub exclusive: bool,
    /// Weight minus one, as on the wire
    pub weight: u8,
}

impl PrioritySpec {
    pub fn new(stream_dependency: u32, exclusive: bool, weight: u8) -> Self {
        PrioritySpec {
            stream_dependency,
            exclusive,
            weight,
        }
    }

    fn decode(mut buf: &[u8]) -> Self {
        let dependency = buf.get_u32();
        PrioritySpec {
            stream_dependency: dependency & 0x7FFF_FFFF,
            exclusive: dependency & 0x8000_0000 != 0,
            weight: buf.get_u8(),
        }
    }
}

/// PRIORITY frame (RFC 9113 Section 6.3)
#[derive(Debug, Clone, Copy)]
pub struct PriorityFrame {
    pub stream_id: u32,
    pub priority: PrioritySpec,
}

/// RST_STREAM frame (RFC 9113 Section 6.4)
#[derive(Debug, Clone, Copy)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub error_code: ErrorCode,
}

/// SETTINGS frame (RFC 9113 Section 6.5)
#[derive(Debug, Clone)]
pub struct SettingsFrame {
    pub ack: bool,
    pub settings: Settings,
}

impl SettingsFrame {
    pub fn new(settings: Settings) -> Self {
        SettingsFrame {
            ack: false,
            settings,
        }
    }

    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            settings: Settings::default(),
        }
    }
}

/// PUSH_PROMISE frame (RFC 9113 Section 6.6)
#[derive(Debug, Clone)]
pub struct PushPromiseFrame {
    pub stream_id: u32,
    pub promised_stream_id: u32,
    pub header_block: Bytes,
    pub end_headers: bool,
}

/// PING frame (RFC 9113 Section 6.7)
#[derive(Debug, Clone, Copy)]
pub struct PingFrame {
    pub ack: bool,
    /// Opaque data (8 bytes)
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn new(data: [u8; 8]) -> Self {
        PingFrame { ack: false, data }
    }

    pub fn ack(data: [u8; 8]) -> Self {
        PingFrame { ack: true, data }
    }
}

/// GOAWAY frame (RFC 9113 Section 6.8)
#[derive(Debug, Clone)]
pub struct GoawayFrame {
    pub last_stream_id: u32,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoawayFrame {
    pub fn new(last_stream_id: u32, error_code: ErrorCode, debug_data: Bytes) -> Self {
        GoawayFrame {
            last_stream_id,
            error_code,
            debug_data,
        }
    }
}

/// WINDOW_UPDATE frame (RFC 9113 Section 6.9)
#[derive(Debug, Clone, Copy)]
pub struct WindowUpdateFrame {
    /// 0 for the connection window
    pub stream_id: u32,
    pub size_increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: u32, size_increment: u32) -> Self {
        WindowUpdateFrame {
            stream_id,
            size_increment,
        }
    }
}

/// CONTINUATION frame (RFC 9113 Section 6.10)
#[derive(Debug, Clone)]
pub struct ContinuationFrame {
    pub stream_id: u32,
    pub header_block: Bytes,
    pub end_headers: bool,
}
