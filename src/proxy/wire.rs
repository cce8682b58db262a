use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::util::timeout_with_context;

/// Reads one `\n`-terminated line into `buf`, enforcing a per-read timeout and a length limit.
///
/// Returns the number of raw bytes consumed; `0` means the peer closed before sending anything.
pub(crate) async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();

    loop {
        let available = timeout_with_context(
            timeout_dur,
            reader.fill_buf(),
            format!("reading line from {peer}"),
        )
        .await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while reading line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow for {peer}"))?
            > max_len
        {
            bail!("line from {peer} exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string = String::from_utf8(collected)
        .map_err(|_| anyhow!("line from {peer} contained invalid bytes"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}

/// Strips the trailing CRLF (or bare LF) from a line read by [`read_line_with_timeout`].
pub(crate) fn trim_line_terminator(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

/// Reads header lines until the first blank one, handing each trimmed line to `on_line`.
///
/// Returns the number of header lines seen (excluding the terminator).
pub(crate) async fn read_header_block<S, F>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_line_len: usize,
    max_lines: usize,
    mut on_line: F,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
    F: FnMut(&str) -> Result<()>,
{
    let mut line = String::new();
    let mut count = 0usize;
    loop {
        let read = read_line_with_timeout(reader, &mut line, timeout_dur, peer, max_line_len).await?;
        if read == 0 {
            bail!("connection from {peer} closed during headers");
        }
        let trimmed = trim_line_terminator(&line);
        if trimmed.is_empty() {
            return Ok(count);
        }
        count += 1;
        ensure!(
            count <= max_lines,
            "header block from {peer} exceeds {max_lines} lines"
        );
        on_line(trimmed)?;
    }
}
