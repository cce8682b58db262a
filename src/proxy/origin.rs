use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::io_util::drain_exact;
use crate::util::is_timeout;

use super::date::http_date;
use super::error::OriginError;
use super::request::InboundRequest;
use super::wire::{read_header_block, read_line_with_timeout, trim_line_terminator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginOutcome {
    NotModified,
    Ok { content_length: u64 },
    Error { status: u16 },
}

impl OriginOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginOutcome::NotModified => "not_modified",
            OriginOutcome::Ok { .. } => "ok",
            OriginOutcome::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OriginLimits {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub max_line_len: usize,
    pub max_header_lines: usize,
    pub max_body_size: u64,
}

/// An origin response whose head has been consumed. For [`OriginOutcome::Ok`] the reader is
/// positioned at the first body byte.
pub struct OriginExchange<S> {
    pub outcome: OriginOutcome,
    pub reader: BufReader<S>,
}

/// Parsed status line and the headers this proxy cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginResponseHead {
    pub status: u16,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

pub async fn connect(host: &str, port: u16, limits: &OriginLimits) -> Result<TcpStream, OriginError> {
    let authority = format!("{host}:{port}");
    let stream = timeout(limits.connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| OriginError::Timeout(format!("connecting to origin {authority}")))?
        .map_err(|source| OriginError::Unreachable {
            authority: authority.clone(),
            source,
        })?;
    if let Err(err) = stream.set_nodelay(true) {
        debug!(origin = %authority, error = %err, "failed to set TCP_NODELAY on origin stream");
    }
    Ok(stream)
}

/// Builds the origin request: the client's request line and origin header forwarded verbatim,
/// plus `If-Modified-Since` when revalidating.
pub fn encode_origin_request(request: &InboundRequest, validator: Option<SystemTime>) -> String {
    let mut message = String::with_capacity(256);
    message.push_str(&request.request_line);
    message.push_str("\r\n");
    message.push_str(&request.header_line);
    message.push_str("\r\n");
    if let Some(modified) = validator {
        message.push_str("If-Modified-Since: ");
        message.push_str(&http_date(modified));
        message.push_str("\r\n");
    }
    message.push_str("\r\n");
    message
}

/// Sends the (possibly conditional) request over `stream` and classifies the response.
pub async fn revalidate<S>(
    stream: S,
    origin_addr: SocketAddr,
    request: &InboundRequest,
    validator: Option<SystemTime>,
    limits: &OriginLimits,
) -> Result<OriginExchange<S>, OriginError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let message = encode_origin_request(request, validator);
    trace!(origin = %origin_addr, conditional = validator.is_some(), "sending origin request");

    timeout(limits.io_timeout, reader.get_mut().write_all(message.as_bytes()))
        .await
        .map_err(|_| OriginError::Timeout("writing origin request".to_string()))??;

    let head = timeout(
        limits.io_timeout,
        read_response_head(&mut reader, origin_addr, limits),
    )
    .await
    .map_err(|_| OriginError::Timeout("reading origin response head".to_string()))??;

    let outcome = classify(&head, limits)?;
    if let OriginOutcome::Error { status } = outcome {
        drain_error_body(&mut reader, &head, limits, status).await;
    }
    Ok(OriginExchange { outcome, reader })
}

pub(crate) fn classify(
    head: &OriginResponseHead,
    limits: &OriginLimits,
) -> Result<OriginOutcome, OriginError> {
    match head.status {
        304 => Ok(OriginOutcome::NotModified),
        200 => {
            if head.chunked {
                return Err(OriginError::Protocol(
                    "chunked origin bodies are not supported".to_string(),
                ));
            }
            let content_length = head
                .content_length
                .ok_or(OriginError::MissingContentLength(200))?;
            if content_length > limits.max_body_size {
                return Err(OriginError::BodyTooLarge {
                    declared: content_length,
                    limit: limits.max_body_size,
                });
            }
            Ok(OriginOutcome::Ok { content_length })
        }
        status => Ok(OriginOutcome::Error { status }),
    }
}

async fn drain_error_body<S>(
    reader: &mut BufReader<S>,
    head: &OriginResponseHead,
    limits: &OriginLimits,
    status: u16,
) where
    S: AsyncRead + Unpin,
{
    let Some(length) = head.content_length else {
        return;
    };
    if length == 0 || length > limits.max_body_size {
        return;
    }
    if let Err(err) = drain_exact(reader, length, limits.io_timeout).await {
        debug!(status, error = %err, "failed to drain origin error body");
    }
}

pub(crate) async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    origin_addr: SocketAddr,
    limits: &OriginLimits,
) -> Result<OriginResponseHead, OriginError>
where
    S: AsyncRead + Unpin,
{
    let protocol = |err: anyhow::Error| {
        if is_timeout(&err) {
            OriginError::Timeout("reading origin response head".to_string())
        } else {
            OriginError::Protocol(format!("{err:#}"))
        }
    };

    let mut status_line = String::new();
    let read = read_line_with_timeout(
        reader,
        &mut status_line,
        limits.io_timeout,
        origin_addr,
        limits.max_line_len,
    )
    .await
    .map_err(protocol)?;
    if read == 0 {
        return Err(OriginError::Protocol(
            "origin closed connection before sending status line".to_string(),
        ));
    }
    let status = parse_status_line(trim_line_terminator(&status_line))?;

    let mut content_length: Option<u64> = None;
    let mut chunked = false;
    let mut header_error: Option<OriginError> = None;
    read_header_block(
        reader,
        limits.io_timeout,
        origin_addr,
        limits.max_line_len,
        limits.max_header_lines,
        |line| {
            let Some((name, value)) = line.split_once(':') else {
                return Ok(());
            };
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                match value.parse::<u64>() {
                    Ok(parsed) => match content_length {
                        Some(existing) if existing != parsed => {
                            header_error.get_or_insert(OriginError::Protocol(
                                "conflicting Content-Length headers from origin".to_string(),
                            ));
                        }
                        _ => content_length = Some(parsed),
                    },
                    Err(_) => {
                        header_error.get_or_insert(OriginError::Protocol(format!(
                            "invalid Content-Length value '{value}'"
                        )));
                    }
                }
            } else if name.eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
            {
                chunked = true;
            }
            Ok(())
        },
    )
    .await
    .map_err(protocol)?;

    if let Some(err) = header_error {
        return Err(err);
    }
    Ok(OriginResponseHead {
        status,
        content_length,
        chunked,
    })
}

pub(crate) fn parse_status_line(line: &str) -> Result<u16, OriginError> {
    let mut parts = line.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| OriginError::Protocol("empty origin status line".to_string()))?;
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(OriginError::Protocol(format!(
            "unsupported origin HTTP version '{version}'"
        )));
    }
    let code = parts
        .next()
        .ok_or_else(|| OriginError::Protocol("origin status line missing status code".to_string()))?;
    let status: u16 = code
        .parse()
        .map_err(|_| OriginError::Protocol(format!("invalid origin status code '{code}'")))?;
    if !(100..=599).contains(&status) || code.len() != 3 {
        return Err(OriginError::Protocol(format!(
            "invalid origin status code '{code}'"
        )));
    }
    Ok(status)
}
