//! RESP2 framing for the store connection.
//!
//! `RespCodec` plugs into `tokio_util::codec::Framed`: replies are decoded
//! incrementally from the read buffer, commands are encoded as arrays of bulk
//! strings.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest bulk string accepted from the server (matches Redis' proto-max-bulk-len).
const BULK_LEN_MAX: usize = 512 * 1024 * 1024;

/// Deepest array nesting accepted from the server.
const ARRAY_DEPTH_MAX: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Option<Bytes>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Build a command frame: an array of bulk strings.
    pub fn command<A: AsRef<[u8]>>(args: &[A]) -> Self {
        RespValue::Array(Some(
            args.iter()
                .map(|arg| RespValue::BulkString(Some(Bytes::copy_from_slice(arg.as_ref()))))
                .collect(),
        ))
    }

    /// Payload of a simple or bulk string.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            RespValue::SimpleString(s) | RespValue::BulkString(Some(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::SimpleString(s) if s.as_ref() == b"OK")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("RESP protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

enum ParseError {
    Incomplete,
    Invalid(String),
}

impl From<String> for ParseError {
    fn from(msg: String) -> Self {
        ParseError::Invalid(msg)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

impl RespCodec {
    /// Parse one frame from the front of `input`, consuming it.
    ///
    /// Returns `Ok(None)` when the buffer holds only part of a frame.
    pub fn parse(input: &mut BytesMut) -> Result<Option<RespValue>, RespError> {
        if input.is_empty() {
            return Ok(None);
        }

        match Self::try_parse(input, 0) {
            Ok((value, consumed)) => {
                input.advance(consumed);
                Ok(Some(value))
            }
            Err(ParseError::Incomplete) => Ok(None),
            Err(ParseError::Invalid(msg)) => Err(RespError::Protocol(msg)),
        }
    }

    fn try_parse(input: &[u8], depth: usize) -> Result<(RespValue, usize), ParseError> {
        let Some(&marker) = input.first() else {
            return Err(ParseError::Incomplete);
        };

        match marker {
            b'+' => {
                let (line, consumed) = Self::line(input)?;
                Ok((RespValue::SimpleString(Bytes::copy_from_slice(line)), consumed))
            }
            b'-' => {
                let (line, consumed) = Self::line(input)?;
                Ok((RespValue::Error(Bytes::copy_from_slice(line)), consumed))
            }
            b':' => {
                let (line, consumed) = Self::line(input)?;
                Ok((RespValue::Integer(Self::parse_int(line)?), consumed))
            }
            b'$' => Self::parse_bulk_string(input),
            b'*' => Self::parse_array(input, depth),
            other => Err(format!("unknown RESP type byte: {:?}", other as char).into()),
        }
    }

    fn parse_bulk_string(input: &[u8]) -> Result<(RespValue, usize), ParseError> {
        let (line, header_len) = Self::line(input)?;
        let len = Self::parse_int(line)?;

        if len == -1 {
            return Ok((RespValue::BulkString(None), header_len));
        }
        if len < 0 || len as u64 > BULK_LEN_MAX as u64 {
            return Err(format!("invalid bulk string length: {}", len).into());
        }

        let start = header_len;
        let end = start + len as usize;
        if end + 2 > input.len() {
            return Err(ParseError::Incomplete);
        }
        if &input[end..end + 2] != b"\r\n" {
            return Err("bulk string not terminated by CRLF".to_string().into());
        }

        let data = Bytes::copy_from_slice(&input[start..end]);
        Ok((RespValue::BulkString(Some(data)), end + 2))
    }

    fn parse_array(input: &[u8], depth: usize) -> Result<(RespValue, usize), ParseError> {
        if depth >= ARRAY_DEPTH_MAX {
            return Err(format!("array nesting deeper than {}", ARRAY_DEPTH_MAX).into());
        }

        let (line, header_len) = Self::line(input)?;
        let len = Self::parse_int(line)?;

        if len == -1 {
            return Ok((RespValue::Array(None), header_len));
        }
        if len < 0 {
            return Err(format!("invalid array length: {}", len).into());
        }

        // Each element needs at least 3 bytes, so this caps the pre-allocation.
        let mut elements = Vec::with_capacity((len as usize).min(input.len() / 3));
        let mut offset = header_len;

        for _ in 0..len {
            if offset >= input.len() {
                return Err(ParseError::Incomplete);
            }
            let (value, consumed) = Self::try_parse(&input[offset..], depth + 1)?;
            elements.push(value);
            offset += consumed;
        }

        Ok((RespValue::Array(Some(elements)), offset))
    }

    /// The header line after the type byte, and the bytes consumed including CRLF.
    fn line(input: &[u8]) -> Result<(&[u8], usize), ParseError> {
        let pos = memchr::memchr_iter(b'\r', input)
            .find(|&pos| input.get(pos + 1) == Some(&b'\n'))
            .ok_or(ParseError::Incomplete)?;
        Ok((&input[1..pos], pos + 2))
    }

    fn parse_int(line: &[u8]) -> Result<i64, ParseError> {
        let s = std::str::from_utf8(line).map_err(|e| e.to_string())?;
        s.parse::<i64>()
            .map_err(|e| format!("invalid integer {:?}: {}", s, e).into())
    }

    pub fn encode_into(value: &RespValue, buf: &mut BytesMut) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s);
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(s);
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::BulkString(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            RespValue::BulkString(Some(data)) => {
                buf.put_u8(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Array(None) => {
                buf.extend_from_slice(b"*-1\r\n");
            }
            RespValue::Array(Some(elements)) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for elem in elements {
                    Self::encode_into(elem, buf);
                }
            }
        }
    }
}

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RespValue>, RespError> {
        Self::parse(src)
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = RespError;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), RespError> {
        Self::encode_into(&item, dst);
        Ok(())
    }
}
