//! SSH wire primitives (RFC 4251 §5) used to build and read request payloads.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of payload: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}

/// Append an SSH `string` (u32 big-endian length followed by the bytes).
pub fn put_string(buf: &mut BytesMut, value: impl AsRef<[u8]>) {
    let value = value.as_ref();
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

pub fn put_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32(value);
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

/// Payload of an `env` channel request.
pub fn env_payload(name: &str, value: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + name.len() + value.len());
    put_string(&mut buf, name);
    put_string(&mut buf, value);
    buf.freeze()
}

/// Bounds-checked cursor over a request payload.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, needed: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u32()? as usize;
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_str(&mut self) -> Result<&'a str, DecodeError> {
        std::str::from_utf8(self.read_bytes()?).map_err(|_| DecodeError::InvalidUtf8)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_payload_layout() {
        let payload = env_payload("LANG", "C");
        assert_eq!(
            payload.as_ref(),
            &[0, 0, 0, 4, b'L', b'A', b'N', b'G', 0, 0, 0, 1, b'C']
        );

        let mut r = Reader::new(&payload);
        assert_eq!(r.read_str().unwrap(), "LANG");
        assert_eq!(r.read_str().unwrap(), "C");
        assert!(r.is_empty());
    }

    #[test]
    fn test_mixed_fields() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "xterm");
        put_u32(&mut buf, 80);
        put_bool(&mut buf, true);

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_str().unwrap(), "xterm");
        assert_eq!(r.read_u32().unwrap(), 80);
        assert!(r.read_bool().unwrap());
        assert!(r.is_empty());
    }

    #[test]
    fn test_truncated_string_is_rejected() {
        // Declares 10 bytes, carries 2.
        let data = [0, 0, 0, 10, b'h', b'i'];
        let err = Reader::new(&data).read_bytes().unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                needed: 10,
                remaining: 2
            }
        );

        assert!(Reader::new(&[0, 1]).read_u32().is_err());
    }

    #[test]
    fn test_invalid_utf8() {
        let data = [0, 0, 0, 1, 0xff];
        assert_eq!(
            Reader::new(&data).read_str().unwrap_err(),
            DecodeError::InvalidUtf8
        );
    }
}
