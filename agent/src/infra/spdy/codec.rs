//! `tokio_util` codec halves for SPDY/3.1 frames
//!
//! Decoding and encoding are split because each direction owns its own zlib
//! context and the two halves run on different tasks.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use super::compress::{HeaderCompressor, HeaderDecompressor};
use super::frame::*;
use crate::error::{Error, Result};

/// Largest frame payload the decoder accepts
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

pub struct SpdyDecoder {
    headers: HeaderDecompressor,
}

impl SpdyDecoder {
    pub fn new() -> Self {
        Self {
            headers: HeaderDecompressor::new(),
        }
    }

    fn decode_control(&mut self, frame_type: u16, flags: u8, mut payload: Bytes) -> Result<Option<Frame>> {
        let need = |payload: &Bytes, n: usize| -> Result<()> {
            if payload.len() < n {
                return Err(Error::Protocol(format!(
                    "control frame type {} too short: {} bytes",
                    frame_type,
                    payload.len()
                )));
            }
            Ok(())
        };

        let frame = match frame_type {
            TYPE_SYN_STREAM => {
                need(&payload, 10)?;
                let stream_id = payload.get_u32() & 0x7fff_ffff;
                let associated_stream_id = payload.get_u32() & 0x7fff_ffff;
                let priority = payload.get_u8() >> 5;
                payload.advance(1);
                let headers = HeaderBlock::decode(&self.headers.decompress(&payload)?)?;
                Frame::SynStream {
                    stream_id,
                    associated_stream_id,
                    priority,
                    flags,
                    headers,
                }
            }
            TYPE_SYN_REPLY => {
                need(&payload, 4)?;
                let stream_id = payload.get_u32() & 0x7fff_ffff;
                let headers = HeaderBlock::decode(&self.headers.decompress(&payload)?)?;
                Frame::SynReply {
                    stream_id,
                    flags,
                    headers,
                }
            }
            TYPE_HEADERS => {
                need(&payload, 4)?;
                let stream_id = payload.get_u32() & 0x7fff_ffff;
                let headers = HeaderBlock::decode(&self.headers.decompress(&payload)?)?;
                Frame::Headers {
                    stream_id,
                    flags,
                    headers,
                }
            }
            TYPE_RST_STREAM => {
                need(&payload, 8)?;
                Frame::RstStream {
                    stream_id: payload.get_u32() & 0x7fff_ffff,
                    status: payload.get_u32(),
                }
            }
            TYPE_SETTINGS => {
                need(&payload, 4)?;
                let count = payload.get_u32() as usize;
                need(&payload, count.saturating_mul(8))?;
                let mut entries = Vec::with_capacity(count.min(16));
                for _ in 0..count {
                    let word = payload.get_u32();
                    entries.push(Setting {
                        flags: (word >> 24) as u8,
                        id: word & 0x00ff_ffff,
                        value: payload.get_u32(),
                    });
                }
                Frame::Settings { flags, entries }
            }
            TYPE_PING => {
                need(&payload, 4)?;
                Frame::Ping {
                    id: payload.get_u32(),
                }
            }
            TYPE_GOAWAY => {
                need(&payload, 4)?;
                let last_good_stream_id = payload.get_u32() & 0x7fff_ffff;
                // SPDY/2 peers omit the status word
                let status = if payload.remaining() >= 4 {
                    payload.get_u32()
                } else {
                    GOAWAY_OK
                };
                Frame::GoAway {
                    last_good_stream_id,
                    status,
                }
            }
            TYPE_WINDOW_UPDATE => {
                need(&payload, 8)?;
                Frame::WindowUpdate {
                    stream_id: payload.get_u32() & 0x7fff_ffff,
                    delta: payload.get_u32() & 0x7fff_ffff,
                }
            }
            other => {
                debug!("Skipping unknown control frame type {}", other);
                return Ok(None);
            }
        };
        Ok(Some(frame))
    }
}

impl Default for SpdyDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SpdyDecoder {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            if src.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
            let word = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
            let flags = (word >> 24) as u8;
            let len = (word & 0x00ff_ffff) as usize;
            if len > MAX_PAYLOAD {
                return Err(Error::Protocol(format!("frame too large: {}", len)));
            }
            if src.len() < FRAME_HEADER_LEN + len {
                src.reserve(FRAME_HEADER_LEN + len - src.len());
                return Ok(None);
            }

            let mut raw = src.split_to(FRAME_HEADER_LEN + len).freeze();
            let first = raw.get_u32();
            raw.advance(4);

            if first & 0x8000_0000 == 0 {
                return Ok(Some(Frame::Data {
                    stream_id: first & 0x7fff_ffff,
                    flags,
                    data: raw,
                }));
            }

            let version = ((first >> 16) & 0x7fff) as u16;
            if version != SPDY_VERSION {
                return Err(Error::Protocol(format!(
                    "unsupported SPDY version {}",
                    version
                )));
            }
            let frame_type = (first & 0xffff) as u16;
            if let Some(frame) = self.decode_control(frame_type, flags, raw)? {
                return Ok(Some(frame));
            }
        }
    }
}

pub struct SpdyEncoder {
    headers: HeaderCompressor,
}

impl SpdyEncoder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            headers: HeaderCompressor::new()?,
        })
    }
}

impl Encoder<Frame> for SpdyEncoder {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        match frame {
            Frame::Data {
                stream_id,
                flags,
                data,
            } => put_data(dst, stream_id, flags, &data),
            Frame::SynStream {
                stream_id,
                associated_stream_id,
                priority,
                flags,
                headers,
            } => {
                let block = self.headers.compress(&headers.encode())?;
                let mut payload = BytesMut::with_capacity(10 + block.len());
                payload.put_u32(stream_id & 0x7fff_ffff);
                payload.put_u32(associated_stream_id & 0x7fff_ffff);
                payload.put_u8((priority & 0x07) << 5);
                payload.put_u8(0);
                payload.put_slice(&block);
                put_control(dst, TYPE_SYN_STREAM, flags, &payload)
            }
            Frame::SynReply {
                stream_id,
                flags,
                headers,
            } => {
                let block = self.headers.compress(&headers.encode())?;
                let mut payload = BytesMut::with_capacity(4 + block.len());
                payload.put_u32(stream_id & 0x7fff_ffff);
                payload.put_slice(&block);
                put_control(dst, TYPE_SYN_REPLY, flags, &payload)
            }
            Frame::Headers {
                stream_id,
                flags,
                headers,
            } => {
                let block = self.headers.compress(&headers.encode())?;
                let mut payload = BytesMut::with_capacity(4 + block.len());
                payload.put_u32(stream_id & 0x7fff_ffff);
                payload.put_slice(&block);
                put_control(dst, TYPE_HEADERS, flags, &payload)
            }
            Frame::RstStream { stream_id, status } => {
                let mut payload = BytesMut::with_capacity(8);
                payload.put_u32(stream_id & 0x7fff_ffff);
                payload.put_u32(status);
                put_control(dst, TYPE_RST_STREAM, 0, &payload)
            }
            Frame::Settings { flags, entries } => {
                let mut payload = BytesMut::with_capacity(4 + entries.len() * 8);
                payload.put_u32(entries.len() as u32);
                for entry in entries {
                    payload.put_u32(((entry.flags as u32) << 24) | (entry.id & 0x00ff_ffff));
                    payload.put_u32(entry.value);
                }
                put_control(dst, TYPE_SETTINGS, flags, &payload)
            }
            Frame::Ping { id } => put_control(dst, TYPE_PING, 0, &id.to_be_bytes()),
            Frame::GoAway {
                last_good_stream_id,
                status,
            } => {
                let mut payload = BytesMut::with_capacity(8);
                payload.put_u32(last_good_stream_id & 0x7fff_ffff);
                payload.put_u32(status);
                put_control(dst, TYPE_GOAWAY, 0, &payload)
            }
            Frame::WindowUpdate { stream_id, delta } => {
                let mut payload = BytesMut::with_capacity(8);
                payload.put_u32(stream_id & 0x7fff_ffff);
                payload.put_u32(delta & 0x7fff_ffff);
                put_control(dst, TYPE_WINDOW_UPDATE, 0, &payload)
            }
        }
    }
}
