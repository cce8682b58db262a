use std::time::Duration;

use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

/// Size of every bounded read/write increment used when moving bodies around.
pub const CHUNK_SIZE: usize = 8192;

pub async fn write_all_with_timeout<S>(
    stream: &mut S,
    bytes: &[u8],
    timeout_dur: Duration,
    context: &str,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(timeout_dur, stream.write_all(bytes), context).await
}

/// Copies exactly `length` bytes from `reader` to `writer` in `CHUNK_SIZE` increments.
///
/// Never reads past `length`. Returns an error if the reader hits EOF first; the caller decides
/// what a short body means for whatever it was writing into.
pub async fn copy_exact<R, W>(
    reader: &mut R,
    writer: &mut W,
    length: u64,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = length;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let read = timeout_with_context(
            read_timeout,
            reader.read(&mut buffer[..want]),
            "reading body chunk",
        )
        .await?;
        if read == 0 {
            bail!(
                "unexpected EOF after {} of {} body bytes",
                length - remaining,
                length
            );
        }
        timeout_with_context(
            write_timeout,
            writer.write_all(&buffer[..read]),
            "writing body chunk",
        )
        .await?;
        remaining -= read as u64;
    }
    Ok(length)
}

/// Reads and discards exactly `length` bytes.
pub async fn drain_exact<R>(reader: &mut R, length: u64, read_timeout: Duration) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut sink = tokio::io::sink();
    copy_exact(reader, &mut sink, length, read_timeout, read_timeout).await
}
