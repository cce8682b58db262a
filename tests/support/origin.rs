use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration as StdDuration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

type Responder = dyn Fn(usize, &str) -> Vec<u8> + Send + Sync;

#[derive(Clone, Default)]
struct Recorded {
    requests: Arc<Mutex<Vec<String>>>,
    arrivals: Arc<Mutex<Vec<Instant>>>,
    count: Arc<AtomicUsize>,
}

/// Scripted origin: answers each request with whatever the responder returns for
/// (zero-based request index, raw request head), then closes.
pub struct MockOrigin {
    addr: SocketAddr,
    recorded: Recorded,
    handle: JoinHandle<()>,
}

impl MockOrigin {
    pub async fn spawn<F>(responder: F) -> Result<Self>
    where
        F: Fn(usize, &str) -> Vec<u8> + Send + Sync + 'static,
    {
        Self::spawn_with_delay(None, responder).await
    }

    pub async fn spawn_with_delay<F>(delay: Option<StdDuration>, responder: F) -> Result<Self>
    where
        F: Fn(usize, &str) -> Vec<u8> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let recorded = Recorded::default();
        let responder: Arc<Responder> = Arc::new(responder);

        let handle = {
            let recorded = recorded.clone();
            tokio::spawn(async move {
                loop {
                    let (socket, _) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(_) => break,
                    };
                    let recorded = recorded.clone();
                    let responder = responder.clone();
                    tokio::spawn(async move {
                        let _ = serve_one(socket, delay, recorded, responder).await;
                    });
                }
            })
        };

        Ok(Self {
            addr,
            recorded,
            handle,
        })
    }

    /// Always answers `200 OK` with `body`.
    pub async fn ok(body: &[u8]) -> Result<Self> {
        let response = ok_response(body);
        Self::spawn(move |_, _| response.clone()).await
    }

    pub async fn status(status_line: &str, body: &str) -> Result<Self> {
        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
        .into_bytes();
        Self::spawn(move |_, _| response.clone()).await
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn request_count(&self) -> usize {
        self.recorded.count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.recorded.requests.lock().clone()
    }

    /// When each request head was fully received, in arrival order.
    pub fn arrivals(&self) -> Vec<Instant> {
        self.recorded.arrivals.lock().clone()
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn ok_response(body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

pub fn not_modified_response() -> Vec<u8> {
    b"HTTP/1.1 304 Not Modified\r\nConnection: close\r\n\r\n".to_vec()
}

async fn serve_one(
    mut socket: TcpStream,
    delay: Option<StdDuration>,
    recorded: Recorded,
    responder: Arc<Responder>,
) -> Result<()> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    if data.is_empty() {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&data).to_string();
    let index = {
        let mut arrivals = recorded.arrivals.lock();
        arrivals.push(Instant::now());
        recorded.requests.lock().push(request.clone());
        recorded.count.fetch_add(1, Ordering::SeqCst)
    };

    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    let response = responder(index, &request);
    socket.write_all(&response).await?;
    socket.shutdown().await?;
    Ok(())
}
