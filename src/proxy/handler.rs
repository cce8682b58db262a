use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use http::StatusCode;
use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, warn};

use crate::logging::AccessLogBuilder;
use crate::metrics;

use super::AppContext;
use super::cache::{CacheKey, FreshnessVerdict};
use super::error::{CacheWriteError, OriginError, RequestError};
use super::error_pages::builtin_page;
use super::origin::{self, OriginOutcome};
use super::relay::{send_body, send_open_file, shutdown_stream};
use super::request::{InboundRequest, parse_inbound_request};
use super::wire::{read_header_block, read_line_with_timeout, trim_line_terminator};

/// The request line and first header line of a connection, terminators stripped.
#[derive(Debug)]
struct ClientHead {
    request_line: String,
    header_line: String,
}

enum Reply {
    /// A cache entry opened while it was known to be complete.
    Entry { file: AsyncFile, path: PathBuf },
    ErrorPage(StatusCode),
}

/// Everything decided about one request before any response byte is written.
struct Resolution {
    reply: Reply,
    verdict: Option<FreshnessVerdict>,
    origin_outcome: Option<&'static str>,
    cache_written: bool,
    error_reason: Option<&'static str>,
    error_detail: Option<String>,
}

impl Resolution {
    fn entry(file: AsyncFile, path: PathBuf, verdict: FreshnessVerdict) -> Self {
        Self {
            reply: Reply::Entry { file, path },
            verdict: Some(verdict),
            origin_outcome: None,
            cache_written: false,
            error_reason: None,
            error_detail: None,
        }
    }

    fn error(status: StatusCode, reason: &'static str, detail: impl Into<String>) -> Self {
        Self {
            reply: Reply::ErrorPage(status),
            verdict: None,
            origin_outcome: None,
            cache_written: false,
            error_reason: Some(reason),
            error_detail: Some(detail.into()),
        }
    }

    fn rejected(err: &RequestError) -> Self {
        Self::error(err.status(), err.reason(), err.to_string())
    }

    fn origin_failed(err: &OriginError) -> Self {
        Self::error(err.status(), err.reason(), err.to_string())
    }

    fn cache_io(err: &io::Error) -> Self {
        Self::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "cache_io_error",
            err.to_string(),
        )
    }

    fn with_verdict(mut self, verdict: FreshnessVerdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    fn with_origin(mut self, outcome: &'static str) -> Self {
        self.origin_outcome = Some(outcome);
        self
    }

    fn status(&self) -> StatusCode {
        match self.reply {
            Reply::Entry { .. } => StatusCode::OK,
            Reply::ErrorPage(status) => status,
        }
    }
}

/// Serves one client connection: one request, one response, then close.
pub async fn handle_connection<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let client_timeout = app.settings.client_timeout();
    let mut reader = BufReader::new(stream);
    let mut log = AccessLogBuilder::new(peer);

    let resolution = match read_client_head(&mut reader, peer, &app).await {
        Ok(None) => {
            debug!(peer = %peer, "client closed connection before sending a request");
            return Ok(());
        }
        Ok(Some(head)) => match parse_inbound_request(&head.request_line, &head.header_line) {
            Ok(request) => {
                log = log
                    .method(request.method.clone())
                    .origin(request.origin_host.clone(), request.origin_port)
                    .path(request.target.clone());
                resolve(&request, &app).await
            }
            Err(err) => {
                if let Some(method) = head.request_line.split_whitespace().next() {
                    log = log.method(method);
                }
                debug!(peer = %peer, error = %err, "rejected client request");
                Resolution::rejected(&err)
            }
        },
        Err(err) => {
            debug!(peer = %peer, error = %err, "failed to read client request");
            Resolution::error(
                StatusCode::BAD_REQUEST,
                "client_read_failed",
                format!("{err:#}"),
            )
        }
    };

    let status = resolution.status();
    let Resolution {
        reply,
        verdict,
        origin_outcome,
        cache_written,
        error_reason,
        error_detail,
    } = resolution;

    let stream = reader.get_mut();
    let sent = match reply {
        Reply::Entry { file, path } => {
            send_open_file(stream, status, file, &path, client_timeout).await
        }
        Reply::ErrorPage(status) => {
            let page = app.error_pages.page_path(status);
            match AsyncFile::open(&page).await {
                Ok(file) => send_open_file(stream, status, file, &page, client_timeout).await,
                Err(err) => {
                    warn!(
                        path = %page.display(),
                        error = %err,
                        "error page unavailable, sending built-in page"
                    );
                    let body = builtin_page(status);
                    send_body(stream, status, "text/html", body.as_bytes(), client_timeout).await
                }
            }
        }
    };
    let bytes_out = match &sent {
        Ok(bytes) => *bytes,
        Err(err) => {
            warn!(peer = %peer, status = status.as_u16(), error = %err, "failed to send response");
            0
        }
    };
    if let Err(err) = shutdown_stream(stream, client_timeout).await {
        debug!(peer = %peer, error = %err, "client stream shutdown failed");
    }

    log = log
        .status(status)
        .bytes_out(bytes_out)
        .cache_written(cache_written)
        .elapsed(started.elapsed());
    if let Some(verdict) = verdict {
        log = log.cache_verdict(verdict.as_str());
    }
    if let Some(outcome) = origin_outcome {
        log = log.origin_outcome(outcome);
    }
    if let Some(reason) = error_reason {
        log = log.error_reason(reason);
    }
    if let Some(detail) = error_detail {
        log = log.error_detail(detail);
    }
    log.log();

    sent.map(|_| ())
}

/// Reads the request line and the origin header line, then drains the rest of the header block.
///
/// Returns `None` when the client closes without sending anything. A request that ends before
/// its header line yields an empty header line, which the parser rejects.
async fn read_client_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    app: &AppContext,
) -> Result<Option<ClientHead>>
where
    S: AsyncRead + Unpin,
{
    let settings = &app.settings;
    let timeout = settings.client_timeout();
    let max_line = settings.max_header_line_size;

    let mut request_line = String::new();
    if read_line_with_timeout(reader, &mut request_line, timeout, peer, max_line).await? == 0 {
        return Ok(None);
    }

    let mut header_line = String::new();
    let read = read_line_with_timeout(reader, &mut header_line, timeout, peer, max_line).await?;
    let header_line = trim_line_terminator(&header_line).to_string();
    if read > 0 && !header_line.is_empty() {
        read_header_block(
            reader,
            timeout,
            peer,
            max_line,
            settings.max_header_lines.saturating_sub(1),
            |_| Ok(()),
        )
        .await?;
    }

    Ok(Some(ClientHead {
        request_line: trim_line_terminator(&request_line).to_string(),
        header_line,
    }))
}

async fn resolve(request: &InboundRequest, app: &AppContext) -> Resolution {
    let cache = &app.cache;
    let key = CacheKey::new(
        request.origin_host.clone(),
        request.origin_port,
        request.target.clone(),
    );
    let path = match cache.prepare_entry_path(&key).await {
        Ok(path) => path,
        Err(err) => {
            warn!(key = %key, error = %err, "failed to prepare cache entry path");
            return Resolution::cache_io(&err);
        }
    };

    match cache.freshness(&path).await {
        Ok(verdict @ FreshnessVerdict::Fresh { .. }) => {
            metrics::record_cache_verdict(verdict.as_str());
            return serve_entry(&path, verdict).await;
        }
        Ok(_) => {}
        Err(err) => return Resolution::cache_io(&err),
    }

    // Whoever holds the lock may be refreshing this entry; re-check once it is ours.
    let _guard = cache.lock(&key).await;
    let verdict = match cache.freshness(&path).await {
        Ok(verdict) => verdict,
        Err(err) => return Resolution::cache_io(&err),
    };
    metrics::record_cache_verdict(verdict.as_str());
    if verdict.is_fresh() {
        debug!(key = %key, "entry refreshed while waiting for lock");
        return serve_entry(&path, verdict).await;
    }

    revalidate_and_store(request, &key, &path, verdict, app).await
}

async fn revalidate_and_store(
    request: &InboundRequest,
    key: &CacheKey,
    path: &Path,
    verdict: FreshnessVerdict,
    app: &AppContext,
) -> Resolution {
    let limits = app.origin_limits();
    let exchange = async {
        let stream = origin::connect(&request.origin_host, request.origin_port, &limits).await?;
        let origin_addr = stream.peer_addr()?;
        origin::revalidate(stream, origin_addr, request, verdict.validator(), &limits).await
    }
    .await;

    let mut exchange = match exchange {
        Ok(exchange) => exchange,
        Err(err) => {
            metrics::record_origin_outcome("failed");
            warn!(key = %key, error = %err, "origin round trip failed");
            return Resolution::origin_failed(&err)
                .with_verdict(verdict)
                .with_origin("failed");
        }
    };
    let outcome = exchange.outcome;
    metrics::record_origin_outcome(outcome.as_str());

    match outcome {
        OriginOutcome::NotModified => {
            if verdict == FreshnessVerdict::Absent {
                let err = OriginError::Protocol("304 received for an uncached resource".into());
                return Resolution::origin_failed(&err)
                    .with_verdict(verdict)
                    .with_origin(outcome.as_str());
            }
            serve_entry(path, verdict).await.with_origin(outcome.as_str())
        }
        OriginOutcome::Ok { content_length } => {
            let cache = &app.cache;
            let written = async {
                cache
                    .writer(path)
                    .await?
                    .fill_from(&mut exchange.reader, content_length, limits.io_timeout)
                    .await
            };
            match written.await {
                Ok(bytes) => {
                    metrics::record_cache_store();
                    debug!(key = %key, bytes, "stored origin body");
                    let mut resolution =
                        serve_entry(path, verdict).await.with_origin(outcome.as_str());
                    resolution.cache_written = true;
                    resolution
                }
                Err(err) => {
                    metrics::record_cache_store_error();
                    warn!(key = %key, error = %err, "failed to store origin body");
                    let status = match err {
                        CacheWriteError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
                        CacheWriteError::ByteCountMismatch { .. } | CacheWriteError::Timeout(_) => {
                            StatusCode::BAD_GATEWAY
                        }
                    };
                    Resolution::error(status, "cache_write_failed", err.to_string())
                        .with_verdict(verdict)
                        .with_origin(outcome.as_str())
                }
            }
        }
        OriginOutcome::Error { status } => {
            debug!(key = %key, status, "origin returned error status");
            Resolution::origin_failed(&OriginError::Status(status))
                .with_verdict(verdict)
                .with_origin(outcome.as_str())
        }
    }
}

/// Opens the entry for relay. The open handle keeps the bytes it refers to even if a newer
/// entry is renamed over `path` before the relay finishes.
async fn serve_entry(path: &Path, verdict: FreshnessVerdict) -> Resolution {
    match AsyncFile::open(path).await {
        Ok(file) => Resolution::entry(file, path.to_path_buf(), verdict),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to open cache entry");
            Resolution::cache_io(&err).with_verdict(verdict)
        }
    }
}
