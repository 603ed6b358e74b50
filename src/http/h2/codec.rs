//! HTTP/2 frame encoding and decoding
//!
//! [`FrameCodec`] turns bytes into [`Frame`]s (buffered, so a read that
//! stops in the middle of a frame is never a problem) and typed frames back
//! into bytes. [`HeaderBlockAssembler`] joins HEADERS and CONTINUATION
//! fragments and enforces that nothing is interleaved with them.

use super::error::{Error, Result};
use super::frames::*;
use super::DEFAULT_MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Read};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Decoded 9-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    pub kind: u8,
    pub flags: FrameFlags,
    pub stream_id: u32,
}

/// Frame codec for encoding/decoding HTTP/2 frames
pub struct FrameCodec {
    read_buffer: BytesMut,
    /// Largest payload we accept (our SETTINGS_MAX_FRAME_SIZE)
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec {
            read_buffer: BytesMut::with_capacity(16 * 1024),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
        }
    }

    pub fn set_max_frame_size(&mut self, size: usize) {
        self.max_frame_size = size;
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame header; the reserved bit is always written as 0
    pub fn encode_header(
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: u32,
        length: usize,
        dst: &mut BytesMut,
    ) {
        dst.reserve(FRAME_HEADER_SIZE + length);
        dst.put_uint(length as u64, 3);
        dst.put_u8(frame_type.as_u8());
        dst.put_u8(flags.as_u8());
        dst.put_u32(stream_id & 0x7FFF_FFFF);
    }

    /// Decode a frame header, ignoring the reserved bit
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
        let mut buf = &bytes[..];
        FrameHeader {
            length: buf.get_uint(3) as usize,
            kind: buf.get_u8(),
            flags: FrameFlags::from_u8(buf.get_u8()),
            stream_id: buf.get_u32() & 0x7FFF_FFFF,
        }
    }

    /// Append received bytes to the read buffer
    pub fn feed(&mut self, bytes: &[u8]) {
        self.read_buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet decoded
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }

    /// Take the next complete frame out of the read buffer
    ///
    /// Returns `Ok(None)` until a whole frame has been fed. A frame larger
    /// than our max frame size is a connection FRAME_SIZE_ERROR.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>> {
        if self.read_buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut raw = [0u8; FRAME_HEADER_SIZE];
        raw.copy_from_slice(&self.read_buffer[..FRAME_HEADER_SIZE]);
        let header = Self::decode_header(&raw);

        if header.length > self.max_frame_size {
            return Err(Error::FrameSize(format!(
                "frame of {} bytes exceeds max frame size {}",
                header.length, self.max_frame_size
            )));
        }

        if self.read_buffer.len() < FRAME_HEADER_SIZE + header.length {
            self.read_buffer.reserve(FRAME_HEADER_SIZE + header.length);
            return Ok(None);
        }

        self.read_buffer.advance(FRAME_HEADER_SIZE);
        let payload = self.read_buffer.split_to(header.length).freeze();
        Ok(Some(Frame {
            kind: header.kind,
            flags: header.flags,
            stream_id: header.stream_id,
            payload,
        }))
    }

    /// Blocking read of one frame from any reader
    pub fn read_frame<R: Read>(&mut self, reader: &mut R) -> Result<Frame> {
        let mut chunk = [0u8; 8192];
        loop {
            if let Some(frame) = self.decode_frame()? {
                return Ok(frame);
            }
            match reader.read(&mut chunk) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => self.feed(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    pub fn encode_data_frame(frame: &DataFrame, dst: &mut BytesMut) {
        let flags = FrameFlags::empty().with(FrameFlags::END_STREAM, frame.end_stream);
        Self::encode_header(FrameType::Data, flags, frame.stream_id, frame.data.len(), dst);
        dst.put_slice(&frame.data);
    }

    /// Encode a complete header block as HEADERS plus CONTINUATION frames
    ///
    /// No fragment is larger than `max_frame_size` (the peer's setting). All
    /// frames land in `dst` back to back, so writing `dst` in one call keeps
    /// the sequence contiguous on the wire.
    pub fn encode_header_block(
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
        max_frame_size: usize,
        dst: &mut BytesMut,
    ) {
        let max_frame_size = max_frame_size.max(1);
        let mut chunks = block.chunks(max_frame_size);
        let first = chunks.next().unwrap_or(&[]);
        let mut rest = chunks.peekable();

        let flags = FrameFlags::empty()
            .with(FrameFlags::END_STREAM, end_stream)
            .with(FrameFlags::END_HEADERS, rest.peek().is_none());
        Self::encode_header(FrameType::Headers, flags, stream_id, first.len(), dst);
        dst.put_slice(first);

        while let Some(chunk) = rest.next() {
            let flags = FrameFlags::empty().with(FrameFlags::END_HEADERS, rest.peek().is_none());
            Self::encode_header(FrameType::Continuation, flags, stream_id, chunk.len(), dst);
            dst.put_slice(chunk);
        }
    }

    pub fn encode_settings_frame(frame: &SettingsFrame, dst: &mut BytesMut) {
        let mut payload = BytesMut::new();
        if !frame.ack {
            frame.settings.encode(&mut payload);
        }
        let flags = FrameFlags::empty().with(FrameFlags::ACK, frame.ack);
        Self::encode_header(FrameType::Settings, flags, 0, payload.len(), dst);
        dst.put_slice(&payload);
    }

    pub fn encode_ping_frame(frame: &PingFrame, dst: &mut BytesMut) {
        let flags = FrameFlags::empty().with(FrameFlags::ACK, frame.ack);
        Self::encode_header(FrameType::Ping, flags, 0, 8, dst);
        dst.put_slice(&frame.data);
    }

    pub fn encode_goaway_frame(frame: &GoawayFrame, dst: &mut BytesMut) {
        Self::encode_header(
            FrameType::Goaway,
            FrameFlags::empty(),
            0,
            8 + frame.debug_data.len(),
            dst,
        );
        dst.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        dst.put_u32(frame.error_code.as_u32());
        dst.put_slice(&frame.debug_data);
    }

    pub fn encode_window_update_frame(frame: &WindowUpdateFrame, dst: &mut BytesMut) {
        Self::encode_header(FrameType::WindowUpdate, FrameFlags::empty(), frame.stream_id, 4, dst);
        dst.put_u32(frame.size_increment & 0x7FFF_FFFF);
    }

    pub fn encode_rst_stream_frame(frame: &RstStreamFrame, dst: &mut BytesMut) {
        Self::encode_header(FrameType::RstStream, FrameFlags::empty(), frame.stream_id, 4, dst);
        dst.put_u32(frame.error_code.as_u32());
    }
}

/// A complete header block ready for HPACK decoding
#[derive(Debug, Clone)]
pub struct HeaderBlock {
    pub stream_id: u32,
    pub end_stream: bool,
    pub block: Bytes,
}

#[derive(Debug)]
struct PartialBlock {
    stream_id: u32,
    end_stream: bool,
    fragments: BytesMut,
}

/// Joins HEADERS and CONTINUATION frames into header blocks
///
/// While a block is open, the only acceptable next frame is a CONTINUATION
/// on the same stream; anything else is a connection PROTOCOL_ERROR.
#[derive(Debug)]
pub struct HeaderBlockAssembler {
    partial: Option<PartialBlock>,
    max_block_size: usize,
}

impl HeaderBlockAssembler {
    pub fn new(max_block_size: usize) -> Self {
        HeaderBlockAssembler {
            partial: None,
            max_block_size,
        }
    }

    /// Stream whose header block is waiting for CONTINUATION frames
    pub fn expecting_continuation(&self) -> Option<u32> {
        self.partial.as_ref().map(|p| p.stream_id)
    }

    /// Reject any frame other than the awaited CONTINUATION
    ///
    /// Call for every frame before dispatching it, unknown types included.
    pub fn check_sequence(&self, frame: &Frame) -> Result<()> {
        match (&self.partial, frame.frame_type()) {
            (None, Some(FrameType::Continuation)) => Err(Error::protocol(format!(
                "CONTINUATION on stream {} without a preceding HEADERS",
                frame.stream_id
            ))),
            (Some(partial), Some(FrameType::Continuation)) if partial.stream_id != frame.stream_id => {
                Err(Error::protocol(format!(
                    "CONTINUATION on stream {} while stream {} has an open header block",
                    frame.stream_id, partial.stream_id
                )))
            }
            (Some(partial), ft) if ft != Some(FrameType::Continuation) => Err(Error::protocol(format!(
                "frame type 0x{:x} interleaved with the header block of stream {}",
                frame.kind, partial.stream_id
            ))),
            _ => Ok(()),
        }
    }

    pub fn headers(&mut self, frame: HeadersFrame) -> Result<Option<HeaderBlock>> {
        self.begin(frame.stream_id, frame.end_stream, frame.header_block, frame.end_headers)
    }

    pub fn continuation(&mut self, frame: ContinuationFrame) -> Result<Option<HeaderBlock>> {
        let Some(partial) = self.partial.as_mut() else {
            return Err(Error::protocol("CONTINUATION without a preceding HEADERS"));
        };
        if partial.stream_id != frame.stream_id {
            return Err(Error::protocol("CONTINUATION for a different stream"));
        }
        if partial.fragments.len() + frame.header_block.len() > self.max_block_size {
            return Err(Error::EnhanceYourCalm(format!(
                "header block on stream {} exceeds {} bytes",
                frame.stream_id, self.max_block_size
            )));
        }
        partial.fragments.extend_from_slice(&frame.header_block);

        if !frame.end_headers {
            return Ok(None);
        }
        Ok(self.partial.take().map(|p| HeaderBlock {
            stream_id: p.stream_id,
            end_stream: p.end_stream,
            block: p.fragments.freeze(),
        }))
    }

    fn begin(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        fragment: Bytes,
        end_headers: bool,
    ) -> Result<Option<HeaderBlock>> {
        if self.partial.is_some() {
            return Err(Error::protocol("new header block before END_HEADERS"));
        }
        if end_headers {
            return Ok(Some(HeaderBlock {
                stream_id,
                end_stream,
                block: fragment,
            }));
        }
        let mut fragments = BytesMut::with_capacity(fragment.len() * 2);
        fragments.extend_from_slice(&fragment);
        self.partial = Some(PartialBlock {
            stream_id,
            end_stream,
            fragments,
        });
        Ok(None)
    }
}
