//! Terminal-size events decoded from the resize stream

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::TerminalSize;

/// Decode concatenated JSON sizes from `stream` and forward each one in order.
/// Stops quietly on the first malformed value, when the stream ends or when
/// the receiver is gone. A slow receiver stalls the decoder.
pub async fn handle_resize_events<R>(mut stream: R, tx: mpsc::Sender<TerminalSize>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(256);
    loop {
        // Drain every complete value already buffered
        loop {
            let (next, consumed) = {
                let mut values =
                    serde_json::Deserializer::from_slice(&buf).into_iter::<TerminalSize>();
                let next = values.next();
                (next, values.byte_offset())
            };
            match next {
                Some(Ok(size)) => {
                    buf.advance(consumed);
                    if tx.send(size).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    debug!("stop decoding resize events, err={}", e);
                    return;
                }
                None => {
                    buf.clear();
                    break;
                }
            }
        }

        match stream.read_buf(&mut buf).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                debug!("resize stream read failed, err={}", e);
                return;
            }
        }
    }
}
