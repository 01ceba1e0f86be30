//! SPDY/3.1 frame model and header block layout

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const SPDY_VERSION: u16 = 3;
pub const CONTROL_BIT: u16 = 0x8000;
pub const FRAME_HEADER_LEN: usize = 8;
pub const MAX_FRAME_LEN: usize = 0x00ff_ffff;

// Control frame types
pub const TYPE_SYN_STREAM: u16 = 1;
pub const TYPE_SYN_REPLY: u16 = 2;
pub const TYPE_RST_STREAM: u16 = 3;
pub const TYPE_SETTINGS: u16 = 4;
pub const TYPE_PING: u16 = 6;
pub const TYPE_GOAWAY: u16 = 7;
pub const TYPE_HEADERS: u16 = 8;
pub const TYPE_WINDOW_UPDATE: u16 = 9;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_UNIDIRECTIONAL: u8 = 0x02;

// RST_STREAM status codes
pub const RST_PROTOCOL_ERROR: u32 = 1;
pub const RST_INVALID_STREAM: u32 = 2;
pub const RST_REFUSED_STREAM: u32 = 3;
pub const RST_CANCEL: u32 = 5;
pub const RST_STREAM_IN_USE: u32 = 8;

// GOAWAY status codes
pub const GOAWAY_OK: u32 = 0;
pub const GOAWAY_PROTOCOL_ERROR: u32 = 1;

/// Name/value pairs of a header block; multiple values share a name, NUL separated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock(Vec<(String, String)>);

impl HeaderBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names are stored lowercased as SPDY/3 requires
    pub fn insert(&mut self, name: &str, value: &str) {
        self.0.push((name.to_ascii_lowercase(), value.to_string()));
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.insert(name, value);
        self
    }

    /// First value of the named header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.split('\0').next())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Uncompressed wire layout: count, then length-prefixed names and values
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32(self.0.len() as u32);
        for (name, value) in &self.0 {
            buf.put_u32(name.len() as u32);
            buf.put_slice(name.as_bytes());
            buf.put_u32(value.len() as u32);
            buf.put_slice(value.as_bytes());
        }
        buf.to_vec()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        fn take_string(buf: &mut &[u8]) -> Result<String> {
            if buf.remaining() < 4 {
                return Err(Error::Protocol("truncated header block".to_string()));
            }
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(Error::Protocol("truncated header block".to_string()));
            }
            let value = String::from_utf8(buf[..len].to_vec())
                .map_err(|_| Error::Protocol("header is not valid utf-8".to_string()))?;
            buf.advance(len);
            Ok(value)
        }

        if buf.remaining() < 4 {
            return Err(Error::Protocol("truncated header block".to_string()));
        }
        let count = buf.get_u32() as usize;
        let mut pairs = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let name = take_string(&mut buf)?;
            let value = take_string(&mut buf)?;
            pairs.push((name, value));
        }
        Ok(Self(pairs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub flags: u8,
    pub id: u32,
    pub value: u32,
}

/// A decoded frame; header blocks are already decompressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    SynStream {
        stream_id: u32,
        associated_stream_id: u32,
        priority: u8,
        flags: u8,
        headers: HeaderBlock,
    },
    SynReply {
        stream_id: u32,
        flags: u8,
        headers: HeaderBlock,
    },
    RstStream {
        stream_id: u32,
        status: u32,
    },
    Settings {
        flags: u8,
        entries: Vec<Setting>,
    },
    Ping {
        id: u32,
    },
    GoAway {
        last_good_stream_id: u32,
        status: u32,
    },
    Headers {
        stream_id: u32,
        flags: u8,
        headers: HeaderBlock,
    },
    WindowUpdate {
        stream_id: u32,
        delta: u32,
    },
    Data {
        stream_id: u32,
        flags: u8,
        data: Bytes,
    },
}

impl Frame {
    pub fn data(stream_id: u32, data: Bytes) -> Self {
        Frame::Data {
            stream_id,
            flags: 0,
            data,
        }
    }

    /// Empty data frame half-closing the stream
    pub fn fin(stream_id: u32) -> Self {
        Frame::Data {
            stream_id,
            flags: FLAG_FIN,
            data: Bytes::new(),
        }
    }

    pub fn reset(stream_id: u32, status: u32) -> Self {
        Frame::RstStream { stream_id, status }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::SynStream { .. } => "SYN_STREAM",
            Frame::SynReply { .. } => "SYN_REPLY",
            Frame::RstStream { .. } => "RST_STREAM",
            Frame::Settings { .. } => "SETTINGS",
            Frame::Ping { .. } => "PING",
            Frame::GoAway { .. } => "GOAWAY",
            Frame::Headers { .. } => "HEADERS",
            Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
            Frame::Data { .. } => "DATA",
        }
    }
}

/// Write a control frame header followed by its payload
pub fn put_control(dst: &mut BytesMut, frame_type: u16, flags: u8, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "control frame payload too large: {}",
            payload.len()
        )));
    }
    dst.reserve(FRAME_HEADER_LEN + payload.len());
    dst.put_u16(CONTROL_BIT | SPDY_VERSION);
    dst.put_u16(frame_type);
    dst.put_u32(((flags as u32) << 24) | payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Write a data frame header followed by its payload
pub fn put_data(dst: &mut BytesMut, stream_id: u32, flags: u8, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "data frame payload too large: {}",
            payload.len()
        )));
    }
    dst.reserve(FRAME_HEADER_LEN + payload.len());
    dst.put_u32(stream_id & 0x7fff_ffff);
    dst.put_u32(((flags as u32) << 24) | payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}
