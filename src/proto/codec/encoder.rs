use bytes::{BufMut, Bytes, BytesMut};

use crate::proto::frame::Frame;

/// A RESP encoder that accumulates encoded frames in a write buffer.
///
/// Commands are queued with [`encode_command`](Encoder::encode_command) and
/// written out in one go, which is what makes pipelining (`send` followed by
/// `flush`) possible.
///
/// # Example
///
/// ```
/// use slotlink::proto::codec::Encoder;
/// use slotlink::proto::frame::Frame;
///
/// let mut encoder = Encoder::new();
/// encoder.encode(&Frame::SimpleString(b"OK".to_vec()));
/// let data = encoder.take();
/// assert_eq!(&data[..], b"+OK\r\n");
/// ```
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    /// Creates a new encoder with an empty buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Encodes a frame into the internal buffer.
    pub fn encode(&mut self, frame: &Frame) {
        match frame {
            Frame::SimpleString(s) => self.put_line(b'+', s),
            Frame::Error(e) => self.put_line(b'-', e),
            Frame::Integer(n) => self.put_line(b':', n.to_string().as_bytes()),
            Frame::BulkString(Some(data)) => self.put_bulk(data),
            Frame::BulkString(None) | Frame::Null => self.buf.extend_from_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                self.put_line(b'*', items.len().to_string().as_bytes());
                for item in items {
                    self.encode(item);
                }
            }
        }
    }

    /// Encodes a command as an array of bulk strings without building a
    /// [`Frame`] first.
    pub fn encode_command(&mut self, args: &[Bytes]) {
        self.put_line(b'*', args.len().to_string().as_bytes());
        for arg in args {
            self.put_bulk(arg);
        }
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Takes the encoded data from the buffer, leaving it empty.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }

    fn put_line(&mut self, marker: u8, payload: &[u8]) {
        self.buf.put_u8(marker);
        self.buf.extend_from_slice(payload);
        self.buf.extend_from_slice(b"\r\n");
    }

    fn put_bulk(&mut self, data: &[u8]) {
        self.put_line(b'$', data.len().to_string().as_bytes());
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_simple_string() {
        let mut encoder = Encoder::new();
        encoder.encode(&Frame::SimpleString(b"OK".to_vec()));
        assert_eq!(encoder.take().as_ref(), b"+OK\r\n");
    }

    #[test]
    fn test_encode_error() {
        let mut encoder = Encoder::new();
        encoder.encode(&Frame::Error(b"MOVED 1 a:1".to_vec()));
        assert_eq!(encoder.take().as_ref(), b"-MOVED 1 a:1\r\n");
    }

    #[test]
    fn test_encode_null_variants() {
        let mut encoder = Encoder::new();
        encoder.encode(&Frame::BulkString(None));
        encoder.encode(&Frame::Null);
        assert_eq!(encoder.take().as_ref(), b"$-1\r\n$-1\r\n");
    }

    #[test]
    fn test_encode_nested_array() {
        let mut encoder = Encoder::new();
        encoder.encode(&Frame::Array(vec![
            Frame::Integer(0),
            Frame::Array(vec![Frame::BulkString(Some(Bytes::from("h")))]),
        ]));
        assert_eq!(encoder.take().as_ref(), b"*2\r\n:0\r\n*1\r\n$1\r\nh\r\n");
    }

    #[test]
    fn test_encode_command_pipeline() {
        let mut encoder = Encoder::new();
        encoder.encode_command(&[Bytes::from("ASKING")]);
        encoder.encode_command(&[Bytes::from("GET"), Bytes::from("x")]);
        assert_eq!(
            encoder.take().as_ref(),
            b"*1\r\n$6\r\nASKING\r\n*2\r\n$3\r\nGET\r\n$1\r\nx\r\n"
        );
        assert!(encoder.is_empty());
    }
}
