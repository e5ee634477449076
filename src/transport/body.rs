//! Request/response body plumbing with HTTP/2 flow control.

use crate::error::{BuildError, Result};
use bytes::{Bytes, BytesMut};
use futures::future::poll_fn;
use h2::{RecvStream, SendStream};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read size for request bodies
pub const BODY_CHUNK_SIZE: usize = 256 * 1024; // 256KB

/// Stream `reader` into `stream` until EOF without ending the stream.
///
/// Read errors are upload failures; send errors are transport failures.
/// Returns the number of bytes sent.
pub async fn pump_body<R>(reader: &mut R, stream: &mut SendStream<Bytes>) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; BODY_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| BuildError::Upload(format!("reading archive stream: {}", e)))?;
        if n == 0 {
            return Ok(total);
        }

        let mut chunk = Bytes::copy_from_slice(&buf[..n]);
        while !chunk.is_empty() {
            stream.reserve_capacity(chunk.len());
            let capacity = match poll_fn(|cx| stream.poll_capacity(cx)).await {
                Some(Ok(capacity)) => capacity,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(BuildError::Protocol(
                        "request stream closed by server during upload".to_string(),
                    ))
                }
            };
            if capacity == 0 {
                continue;
            }
            let part = chunk.split_to(capacity.min(chunk.len()));
            total += part.len() as u64;
            stream.send_data(part, false)?;
        }
    }
}

/// Hand `len` consumed bytes back to the peer's send window.
///
/// Fails only once the stream is already closed; the next read reports that.
pub fn release_capacity(body: &mut RecvStream, len: usize) {
    if let Err(e) = body.flow_control().release_capacity(len) {
        tracing::trace!("release_capacity({}) on closed stream: {}", len, e);
    }
}

/// Collect a whole response body in memory.
pub async fn read_body(body: &mut RecvStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        release_capacity(body, chunk.len());
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Stream a response body into `writer`. `path` names the destination for
/// error reporting.
pub async fn copy_body<W>(body: &mut RecvStream, writer: &mut W, path: &Path) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        let len = chunk.len();
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| BuildError::file_io(path, e))?;
        release_capacity(body, len);
        total += len as u64;
    }
    Ok(total)
}
