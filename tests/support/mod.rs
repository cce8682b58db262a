#![allow(dead_code)]

pub mod harness;
pub mod origin;

pub use harness::{ProxyHarness, ProxyHarnessBuilder};
pub use origin::MockOrigin;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration as StdDuration, SystemTime};

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const IO_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// A response as the client saw it.
#[derive(Debug, Clone)]
pub struct TestResponse {
    pub status_line: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

pub fn parse_response(raw: &[u8]) -> Result<TestResponse> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("response has no header terminator"))?;
    let head = std::str::from_utf8(&raw[..split]).context("response head is not UTF-8")?;
    let mut lines = head.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| anyhow!("empty response"))?
        .to_string();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code in '{status_line}'"))?
        .parse::<u16>()?;
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();
    Ok(TestResponse {
        status_line,
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    })
}

/// Sends `request` verbatim and reads until the proxy closes the connection.
pub async fn send_raw(addr: SocketAddr, request: &str) -> Result<TestResponse> {
    let mut stream = timeout(IO_TIMEOUT, TcpStream::connect(addr)).await??;
    stream.write_all(request.as_bytes()).await?;
    let mut raw = Vec::new();
    timeout(IO_TIMEOUT, stream.read_to_end(&mut raw))
        .await
        .context("timed out waiting for proxy response")??;
    parse_response(&raw)
}

pub fn get_request(path: &str, origin_port: u16) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: {}:{origin_port}\r\n\r\n", Ipv4Addr::LOCALHOST)
}

pub fn find_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

pub fn mtime(path: &std::path::Path) -> Result<SystemTime> {
    Ok(std::fs::metadata(path)?.modified()?)
}

/// Pushes the entry's mtime `by` into the past so the next lookup sees it as stale.
pub fn age_entry(path: &std::path::Path, by: StdDuration) -> Result<SystemTime> {
    let modified = SystemTime::now() - by;
    std::fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(modified)?;
    Ok(mtime(path)?)
}
