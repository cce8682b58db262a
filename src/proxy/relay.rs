use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use http::StatusCode;
use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::io_util::{copy_exact, write_all_with_timeout};
use crate::util::{lowercase_extension, timeout_with_context};

use super::date::http_date_now;

pub fn content_type_for(path: &Path) -> &'static str {
    match lowercase_extension(path).as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("png") => "image/png",
        Some("html") | Some("htm") => "text/html",
        _ => "application/octet-stream",
    }
}

/// Reason phrases sent on the status line; 501/505 keep this proxy's historical wording.
pub fn reason_phrase(status: StatusCode) -> &'static str {
    match status {
        StatusCode::NOT_IMPLEMENTED => "Method Not Implemented",
        StatusCode::HTTP_VERSION_NOT_SUPPORTED => "Version Not Supported",
        other => other.canonical_reason().unwrap_or("Unknown"),
    }
}

pub fn encode_response_head(
    status: StatusCode,
    date: &str,
    content_type: &str,
    content_length: u64,
) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nDate: {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        status.as_u16(),
        reason_phrase(status),
        date,
        content_type,
        content_length
    )
}

/// Sends `status` with the open `file` as the body.
///
/// Content-Length is taken from the open handle, so a concurrent rename of a newer entry over
/// `path` cannot make the header and body disagree. Returns bytes written.
pub async fn send_open_file<S>(
    stream: &mut S,
    status: StatusCode,
    mut file: AsyncFile,
    path: &Path,
    timeout_dur: Duration,
) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let length = file
        .metadata()
        .await
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    let head = encode_response_head(status, &http_date_now(), content_type_for(path), length);
    write_all_with_timeout(stream, head.as_bytes(), timeout_dur, "writing response head").await?;
    copy_exact(&mut file, stream, length, timeout_dur, timeout_dur)
        .await
        .with_context(|| format!("relaying {}", path.display()))?;
    timeout_with_context(timeout_dur, stream.flush(), "flushing response").await?;
    Ok(head.len() as u64 + length)
}

/// Sends `status` with an in-memory body. Returns bytes written.
pub async fn send_body<S>(
    stream: &mut S,
    status: StatusCode,
    content_type: &str,
    body: &[u8],
    timeout_dur: Duration,
) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let head = encode_response_head(status, &http_date_now(), content_type, body.len() as u64);
    write_all_with_timeout(stream, head.as_bytes(), timeout_dur, "writing response head").await?;
    write_all_with_timeout(stream, body, timeout_dur, "writing response body").await?;
    timeout_with_context(timeout_dur, stream.flush(), "flushing response").await?;
    Ok((head.len() + body.len()) as u64)
}

pub async fn shutdown_stream<S>(stream: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(
        timeout_dur,
        stream.shutdown(),
        "shutting down client stream",
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[test]
    fn maps_content_types_by_extension() {
        assert_eq!(content_type_for(Path::new("a.jpg")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("a.JPEG")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("a.gif")), "image/gif");
        assert_eq!(content_type_for(Path::new("img.png")), "image/png");
        assert_eq!(content_type_for(Path::new("x/index.html")), "text/html");
        assert_eq!(content_type_for(Path::new("x/index.htm")), "text/html");
        assert_eq!(
            content_type_for(Path::new("archive.tar.gz")),
            "application/octet-stream"
        );
        assert_eq!(
            content_type_for(Path::new("no_extension")),
            "application/octet-stream"
        );
    }

    #[test]
    fn head_uses_fixed_reason_phrases() {
        let head = encode_response_head(
            StatusCode::NOT_IMPLEMENTED,
            "Sun, 06 Nov 1994 08:49:37 GMT",
            "text/html",
            12,
        );
        assert_eq!(
            head,
            "HTTP/1.1 501 Method Not Implemented\r\nDate: Sun, 06 Nov 1994 08:49:37 GMT\r\nContent-Type: text/html\r\nContent-Length: 12\r\n\r\n"
        );
        assert!(
            encode_response_head(StatusCode::HTTP_VERSION_NOT_SUPPORTED, "d", "t", 0)
                .starts_with("HTTP/1.1 505 Version Not Supported\r\n")
        );
        assert!(
            encode_response_head(StatusCode::NOT_FOUND, "d", "t", 0)
                .starts_with("HTTP/1.1 404 Not Found\r\n")
        );
    }

    #[tokio::test]
    async fn streams_file_with_exact_length() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("img.png");
        let body = vec![0xabu8; 20_000];
        std::fs::write(&path, &body)?;

        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let file = AsyncFile::open(&path).await?;
        let written =
            send_open_file(&mut server, StatusCode::OK, file, &path, Duration::from_secs(1))
                .await?;
        drop(server);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await?;
        assert_eq!(written, received.len() as u64);

        let split = received
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("header terminator")
            + 4;
        let head = String::from_utf8_lossy(&received[..split]);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("\r\nDate: "));
        assert!(head.contains("Content-Type: image/png\r\n"));
        assert!(head.contains("Content-Length: 20000\r\n"));
        assert_eq!(&received[split..], &body[..]);
        Ok(())
    }

    #[tokio::test]
    async fn sends_in_memory_body() -> Result<()> {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let body = b"<html>gone</html>";
        let written = send_body(
            &mut server,
            StatusCode::NOT_FOUND,
            "text/html",
            body,
            Duration::from_secs(1),
        )
        .await?;
        drop(server);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await?;
        assert_eq!(written, received.len() as u64);
        let text = String::from_utf8_lossy(&received);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.contains("Content-Length: 17\r\n"));
        assert!(text.ends_with("\r\n\r\n<html>gone</html>"));
        Ok(())
    }
}
