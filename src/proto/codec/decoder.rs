use bytes::{Buf, Bytes, BytesMut};

use crate::proto::error::DecodeError;
use crate::proto::frame::Frame;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024; // 512 MB default
const MAX_DEPTH: usize = 128;

/// An incremental RESP decoder.
///
/// Bytes are fed with [`append`](Decoder::append) as they arrive and frames
/// are pulled with [`decode`](Decoder::decode). A frame is only consumed from
/// the buffer once it is complete, so a reply split across several reads is
/// decoded correctly.
///
/// # Example
///
/// ```
/// use slotlink::proto::codec::Decoder;
/// use slotlink::proto::frame::Frame;
///
/// let mut decoder = Decoder::new();
/// decoder.append(b"+OK\r\n");
/// let frame = decoder.decode().unwrap().unwrap();
/// assert_eq!(frame, Frame::SimpleString(b"OK".to_vec()));
/// ```
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_frame_size: usize,
    /// Buffer length below which the pending frame cannot be complete.
    need: usize,
}

impl Decoder {
    /// Creates a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a new decoder with a custom maximum frame size.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
            need: 0,
        }
    }

    /// Appends raw bytes read from the network.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempts to decode one frame.
    ///
    /// Returns `Ok(None)` when more data is needed; the buffer is left
    /// untouched in that case.
    pub fn decode(&mut self) -> Result<Option<Frame>, DecodeError> {
        if self.buf.len() < self.need {
            return Ok(None);
        }

        let mut cursor = Cursor {
            buf: &self.buf,
            pos: 0,
            max: self.max_frame_size,
            need: 0,
        };
        match cursor.parse(0)? {
            Some(frame) => {
                let consumed = cursor.pos;
                self.buf.advance(consumed);
                self.need = 0;
                Ok(Some(frame))
            }
            None if self.buf.len() > self.max_frame_size => Err(DecodeError::TooLarge {
                size: self.buf.len(),
                max: self.max_frame_size,
            }),
            None => {
                self.need = cursor.need;
                Ok(None)
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    max: usize,
    need: usize,
}

impl Cursor<'_> {
    /// Parses one frame at `pos`. On `Ok(None)`, `need` holds the buffer
    /// length required before another attempt can get further.
    fn parse(&mut self, depth: usize) -> Result<Option<Frame>, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep { max: MAX_DEPTH });
        }
        let buf = self.buf;
        let Some(&marker) = buf.get(self.pos) else {
            self.need = self.pos + 1;
            return Ok(None);
        };
        let Some(end) = find_crlf(buf, self.pos + 1) else {
            self.need = buf.len() + 1;
            return Ok(None);
        };
        let line = &buf[self.pos + 1..end];
        self.pos = end + 2;

        match marker {
            b'+' => Ok(Some(Frame::SimpleString(line.to_vec()))),
            b'-' => Ok(Some(Frame::Error(line.to_vec()))),
            b':' => parse_int(line).map(|n| Some(Frame::Integer(n))),
            b'$' => {
                let Some(len) = parse_len(line, self.max)? else {
                    return Ok(Some(Frame::BulkString(None)));
                };
                let end = self.pos + len + 2;
                if buf.len() < end {
                    self.need = end;
                    return Ok(None);
                }
                if &buf[end - 2..end] != b"\r\n" {
                    return Err(DecodeError::MissingTerminator);
                }
                let data = Bytes::copy_from_slice(&buf[self.pos..end - 2]);
                self.pos = end;
                Ok(Some(Frame::BulkString(Some(data))))
            }
            b'*' => {
                let Some(len) = parse_len(line, self.max)? else {
                    return Ok(Some(Frame::Null));
                };
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    match self.parse(depth + 1)? {
                        Some(frame) => items.push(frame),
                        None => return Ok(None),
                    }
                }
                Ok(Some(Frame::Array(items)))
            }
            other => Err(DecodeError::UnknownType(other as char)),
        }
    }
}

/// Parses a length header; negative lengths mean null.
fn parse_len(line: &[u8], max: usize) -> Result<Option<usize>, DecodeError> {
    let len = parse_int(line)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if len > max {
        return Err(DecodeError::TooLarge { size: len, max });
    }
    Ok(Some(len))
}

fn parse_int(line: &[u8]) -> Result<i64, DecodeError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| DecodeError::InvalidNumber(String::from_utf8_lossy(line).into_owned()))
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}
