use std::fmt;

use super::error::RequestError;

pub const SUPPORTED_METHOD: &str = "GET";
pub const SUPPORTED_VERSION: &str = "HTTP/1.1";

/// A client request after parsing the request line and the origin header line.
///
/// The raw lines are kept (without their terminators) because they are forwarded to the origin
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub origin_host: String,
    pub origin_port: u16,
    pub request_line: String,
    pub header_line: String,
}

impl fmt::Display for InboundRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{}{}",
            self.method, self.origin_host, self.origin_port, self.target
        )
    }
}

/// Parses the request line and the first header line of a connection.
///
/// The method is checked first, before the shape of the rest of the line, so `POST /form` or a
/// `POST` with a garbage header still yields `MethodNotSupported`. Version comes next, and both
/// before the header line.
pub fn parse_inbound_request(
    request_line: &str,
    header_line: &str,
) -> Result<InboundRequest, RequestError> {
    match request_line.split_whitespace().next() {
        Some(SUPPORTED_METHOD) => {}
        Some(method) => return Err(RequestError::MethodNotSupported(method.to_string())),
        None => return Err(RequestError::MalformedRequestLine(request_line.to_string())),
    }
    let (method, target, version) = split_request_line(request_line)?;

    if version != SUPPORTED_VERSION {
        return Err(RequestError::VersionNotSupported(version.to_string()));
    }
    validate_target(target)?;
    let (origin_host, origin_port) = parse_origin_header(header_line)?;

    Ok(InboundRequest {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        origin_host,
        origin_port,
        request_line: request_line.to_string(),
        header_line: header_line.to_string(),
    })
}

fn split_request_line(line: &str) -> Result<(&str, &str, &str), RequestError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) => Ok((method, target, version)),
        _ => Err(RequestError::MalformedRequestLine(line.to_string())),
    }
}

fn validate_target(target: &str) -> Result<(), RequestError> {
    if !target.starts_with('/') || target.contains('\0') {
        return Err(RequestError::InvalidTarget(target.to_string()));
    }
    if target
        .split('/')
        .any(|segment| segment == "." || segment == "..")
    {
        return Err(RequestError::InvalidTarget(target.to_string()));
    }
    Ok(())
}

/// Parses `<label>: <host>:<port>`.
pub fn parse_origin_header(line: &str) -> Result<(String, u16), RequestError> {
    let malformed = |detail: &str| RequestError::MalformedHeader(format!("{detail} in '{line}'"));

    let (label, authority) = line
        .split_once(':')
        .ok_or_else(|| malformed("missing ':' after header label"))?;
    if label.trim().is_empty() {
        return Err(malformed("empty header label"));
    }
    let (host, port) = authority
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| malformed("missing origin port"))?;
    let host = host.trim();
    if host.is_empty() {
        return Err(malformed("empty origin host"));
    }
    if host
        .chars()
        .any(|c| c == ':' || c == '/' || c == '\\' || c == '\0' || c.is_whitespace())
    {
        return Err(malformed("invalid character in origin host"));
    }
    let port: u16 = port
        .trim()
        .parse()
        .map_err(|_| malformed("invalid origin port"))?;
    if port == 0 {
        return Err(malformed("origin port out of range"));
    }
    Ok((host.to_string(), port))
}
