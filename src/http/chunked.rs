//! Chunked transfer coding (RFC 9112 Section 7.1)
//!
//! The encoder side writes into a `BytesMut` so the caller decides when the
//! bytes hit the socket. The decoder works on a receive buffer in place and
//! hands out chunk data without copying.

use super::{Error, Headers, Result, CRLF};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Longest chunk-size line we accept, extensions included
const MAX_CHUNK_LINE: usize = 4096;

/// Largest trailer section we accept
const MAX_TRAILER_SIZE: usize = 16 * 1024;

/// Append one chunk; empty data is skipped since it would end the body
pub fn encode_chunk(data: &[u8], dst: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    dst.reserve(data.len() + 20);
    dst.put_slice(format!("{:x}{}", data.len(), CRLF).as_bytes());
    dst.put_slice(data);
    dst.put_slice(CRLF.as_bytes());
}

/// Append the last chunk and an optional trailer section
pub fn encode_last_chunk(trailers: Option<&Headers>, dst: &mut BytesMut) {
    dst.put_slice(b"0\r\n");
    if let Some(trailers) = trailers {
        for (name, value) in trailers.iter() {
            dst.put_slice(name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(CRLF.as_bytes());
        }
    }
    dst.put_slice(CRLF.as_bytes());
}

/// Encode complete data as a chunked body
pub fn encode_chunked_body(data: &[u8], chunk_size: usize) -> Bytes {
    let mut output = BytesMut::new();
    for chunk in data.chunks(chunk_size.max(1)) {
        encode_chunk(chunk, &mut output);
    }
    encode_last_chunk(None, &mut output);
    output.freeze()
}

/// Progress of a [`ChunkedDecoder`]
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// Body data
    Data(Bytes),
    /// The buffer holds no complete unit; read more
    NeedMore,
    /// Last chunk and trailer section consumed
    Done(Headers),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecoderState {
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkEnd,
    Trailer,
    Complete,
}

/// Chunked decoder
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: DecoderState,
    trailers: Headers,
    trailer_size: usize,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: DecoderState::ChunkSize,
            trailers: Headers::new(),
            trailer_size: 0,
        }
    }

    /// Consume as much of `buf` as possible, returning at most one piece
    /// of data
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded> {
        loop {
            match self.state {
                DecoderState::ChunkSize => {
                    let Some(line) = take_line(buf, MAX_CHUNK_LINE)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        DecoderState::Trailer
                    } else {
                        DecoderState::ChunkData { remaining: size }
                    };
                }

                DecoderState::ChunkData { remaining } => {
                    if buf.is_empty() {
                        return Ok(Decoded::NeedMore);
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    let data = buf.split_to(take).freeze();
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        DecoderState::ChunkEnd
                    } else {
                        DecoderState::ChunkData { remaining }
                    };
                    return Ok(Decoded::Data(data));
                }

                DecoderState::ChunkEnd => {
                    if buf.len() < 2 {
                        return Ok(Decoded::NeedMore);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Error::Protocol("Expected CRLF after chunk".to_string()));
                    }
                    buf.advance(2);
                    self.state = DecoderState::ChunkSize;
                }

                DecoderState::Trailer => {
                    let Some(line) = take_line(buf, MAX_TRAILER_SIZE)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    if line.is_empty() {
                        self.state = DecoderState::Complete;
                        return Ok(Decoded::Done(std::mem::take(&mut self.trailers)));
                    }
                    self.trailer_size += line.len() + 2;
                    if self.trailer_size > MAX_TRAILER_SIZE {
                        return Err(Error::Protocol("trailer section too large".to_string()));
                    }
                    let (name, value) = Headers::parse_header_line(&String::from_utf8_lossy(&line))?;
                    self.trailers.insert(name, value);
                }

                DecoderState::Complete => return Ok(Decoded::Done(Headers::new())),
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == DecoderState::Complete
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Split off one CRLF-terminated line, without the CRLF
fn take_line(buf: &mut BytesMut, limit: usize) -> Result<Option<Bytes>> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            let line = buf.split_to(pos).freeze();
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > limit => Err(Error::Protocol("chunk line too long".to_string())),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let digits = line
        .split(|&b| b == b';')
        .next()
        .unwrap_or_default()
        .trim_ascii();
    let invalid = || Error::InvalidChunkSize(String::from_utf8_lossy(line).into_owned());

    if digits.is_empty() || digits.len() > 16 {
        return Err(invalid());
    }
    digits.iter().try_fold(0u64, |acc, &d| {
        let nibble = (d as char).to_digit(16).ok_or_else(invalid)?;
        Ok(acc << 4 | nibble as u64)
    })
}

/// Decode a complete chunked body
pub fn decode_chunked_body(input: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ChunkedDecoder::new();
    let mut buf = BytesMut::from(input);
    let mut output = Vec::new();

    loop {
        match decoder.decode(&mut buf)? {
            Decoded::Data(data) => output.extend_from_slice(&data),
            Decoded::NeedMore => return Err(Error::Incomplete),
            Decoded::Done(_) => return Ok(output),
        }
    }
}
