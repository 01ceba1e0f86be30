//! zlib header block compression with the SPDY/3 dictionary
//!
//! Each direction of a session keeps one compression context for its whole
//! lifetime, so a compressor or decompressor must never be shared between
//! sessions or recreated mid-session.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::codec::MAX_PAYLOAD;
use crate::error::{Error, Result};

#[rustfmt::skip]
pub const SPDY_DICTIONARY: &[u8] = concat!(
    "\0\0\0\x07options",
    "\0\0\0\x04head",
    "\0\0\0\x04post",
    "\0\0\0\x03put",
    "\0\0\0\x06delete",
    "\0\0\0\x05trace",
    "\0\0\0\x06accept",
    "\0\0\0\x0eaccept-charset",
    "\0\0\0\x0faccept-encoding",
    "\0\0\0\x0faccept-language",
    "\0\0\0\x0daccept-ranges",
    "\0\0\0\x03age",
    "\0\0\0\x05allow",
    "\0\0\0\x0dauthorization",
    "\0\0\0\x0dcache-control",
    "\0\0\0\x0aconnection",
    "\0\0\0\x0ccontent-base",
    "\0\0\0\x10content-encoding",
    "\0\0\0\x10content-language",
    "\0\0\0\x0econtent-length",
    "\0\0\0\x10content-location",
    "\0\0\0\x0bcontent-md5",
    "\0\0\0\x0dcontent-range",
    "\0\0\0\x0ccontent-type",
    "\0\0\0\x04date",
    "\0\0\0\x04etag",
    "\0\0\0\x06expect",
    "\0\0\0\x07expires",
    "\0\0\0\x04from",
    "\0\0\0\x04host",
    "\0\0\0\x08if-match",
    "\0\0\0\x11if-modified-since",
    "\0\0\0\x0dif-none-match",
    "\0\0\0\x08if-range",
    "\0\0\0\x13if-unmodified-since",
    "\0\0\0\x0dlast-modified",
    "\0\0\0\x08location",
    "\0\0\0\x0cmax-forwards",
    "\0\0\0\x06pragma",
    "\0\0\0\x12proxy-authenticate",
    "\0\0\0\x13proxy-authorization",
    "\0\0\0\x05range",
    "\0\0\0\x07referer",
    "\0\0\0\x0bretry-after",
    "\0\0\0\x06server",
    "\0\0\0\x02te",
    "\0\0\0\x07trailer",
    "\0\0\0\x11transfer-encoding",
    "\0\0\0\x07upgrade",
    "\0\0\0\x0auser-agent",
    "\0\0\0\x04vary",
    "\0\0\0\x03via",
    "\0\0\0\x07warning",
    "\0\0\0\x10www-authenticate",
    "\0\0\0\x06method",
    "\0\0\0\x03get",
    "\0\0\0\x06status",
    "\0\0\0\x06200 OK",
    "\0\0\0\x07version",
    "\0\0\0\x08HTTP/1.1",
    "\0\0\0\x03url",
    "\0\0\0\x06public",
    "\0\0\0\x0aset-cookie",
    "\0\0\0\x0akeep-alive",
    "\0\0\0\x06origin",
    "100101201202205206300302303304305306307402405406407408409410411412413414",
    "415416417502504505203 Non-Authoritative Information204 No Content301 Mov",
    "ed Permanently400 Bad Request401 Unauthorized403 Forbidden404 Not Found5",
    "00 Internal Server Error501 Not Implemented503 Service UnavailableJan Fe",
    "b Mar Apr May Jun Jul Aug Sept Oct Nov Dec 00:00:00 Mon, Tue, Wed, Thu, ",
    "Fri, Sat, Sun, GMTchunked,text/html,image/png,image/jpg,image/gif,applic",
    "ation/xml,application/xhtml+xml,text/plain,text/javascript,publicprivate",
    "max-age=gzip,deflate,sdchcharset=utf-8charset=iso-8859-1,utf-,*,enq=0.",).as_bytes();

const CHUNK: usize = 4096;

/// Compresses header blocks written by one side of a session
pub struct HeaderCompressor {
    inner: Compress,
}

impl HeaderCompressor {
    pub fn new() -> Result<Self> {
        let mut inner = Compress::new(Compression::default(), true);
        inner
            .set_dictionary(SPDY_DICTIONARY)
            .map_err(|e| Error::Protocol(format!("set compression dictionary: {}", e)))?;
        Ok(Self { inner })
    }

    pub fn compress(&mut self, block: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(block.len() + 64);
        let mut consumed = 0usize;
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(CHUNK);
            }
            let before = self.inner.total_in();
            self.inner
                .compress_vec(&block[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| Error::Protocol(format!("compress header block: {}", e)))?;
            consumed += (self.inner.total_in() - before) as usize;

            // A sync flush is complete once all input is taken and output was not cut short
            if consumed == block.len() && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }
}

/// Inflates header blocks received from the peer
pub struct HeaderDecompressor {
    inner: Decompress,
}

impl HeaderDecompressor {
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(true),
        }
    }

    /// Inflate one header block; output beyond `MAX_PAYLOAD` fails the frame
    pub fn decompress(&mut self, block: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity((block.len() * 4 + 64).min(MAX_PAYLOAD));
        let mut consumed = 0usize;
        loop {
            if out.len() > MAX_PAYLOAD {
                return Err(Error::Protocol(format!(
                    "header block inflates beyond {} bytes",
                    MAX_PAYLOAD
                )));
            }
            if out.capacity() - out.len() < 64 {
                out.reserve(CHUNK);
            }
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();
            match self
                .inner
                .decompress_vec(&block[consumed..], &mut out, FlushDecompress::Sync)
            {
                Ok(Status::StreamEnd) => {
                    consumed += (self.inner.total_in() - before_in) as usize;
                    if consumed < block.len() {
                        return Err(Error::Protocol(
                            "trailing data after header stream end".to_string(),
                        ));
                    }
                    return within_limit(out);
                }
                Ok(_) => {
                    consumed += (self.inner.total_in() - before_in) as usize;
                    let progressed = self.inner.total_in() != before_in
                        || self.inner.total_out() != before_out;
                    if consumed == block.len() && out.len() < out.capacity() {
                        return within_limit(out);
                    }
                    if !progressed && out.len() < out.capacity() {
                        return Err(Error::Protocol("truncated header block".to_string()));
                    }
                }
                Err(e) if e.needs_dictionary().is_some() => {
                    consumed += (self.inner.total_in() - before_in) as usize;
                    self.inner
                        .set_dictionary(SPDY_DICTIONARY)
                        .map_err(|e| Error::Protocol(format!("set header dictionary: {}", e)))?;
                }
                Err(e) => {
                    return Err(Error::Protocol(format!("decompress header block: {}", e)));
                }
            }
        }
    }
}

fn within_limit(out: Vec<u8>) -> Result<Vec<u8>> {
    if out.len() > MAX_PAYLOAD {
        return Err(Error::Protocol(format!(
            "header block inflates beyond {} bytes",
            MAX_PAYLOAD
        )));
    }
    Ok(out)
}

impl Default for HeaderDecompressor {
    fn default() -> Self {
        Self::new()
    }
}
