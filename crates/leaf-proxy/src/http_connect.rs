//! HTTP `CONNECT` tunnel handshake.
//!
//! ```text
//! Client                                   Proxy
//!   |-- CONNECT host:port HTTP/1.1 ---------->|
//!   |   Host: host:port                       |
//!   |   Proxy-Authorization: Basic ...        |
//!   |<-------------- HTTP/1.1 200 ... --------|
//!   |        [raw bytes to host:port]         |
//! ```

use crate::directive::Credentials;
use crate::error::ProxyError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on the proxy's response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Maximum number of response headers accepted from the proxy
const MAX_HEADERS: usize = 32;

/// Build the `CONNECT` request head
pub(crate) fn build_request(target: &str, credentials: Option<&Credentials>) -> String {
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(creds) = credentials {
        let token = STANDARD.encode(format!("{}:{}", creds.username(), creds.password()));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("Proxy-Connection: keep-alive\r\n\r\n");
    request
}

/// Perform the `CONNECT` handshake on an already-connected proxy stream
///
/// The response head is read one byte at a time so that no tunneled bytes
/// are consumed from the stream.
///
/// # Errors
///
/// - [`ProxyError::AuthFailed`] on `407 Proxy Authentication Required`
/// - [`ProxyError::Rejected`] on any other non-2xx status
/// - [`ProxyError::Protocol`] if the response cannot be parsed
pub async fn handshake<S>(
    stream: &mut S,
    target: &str,
    credentials: Option<&Credentials>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(build_request(target, credentials).as_bytes())
        .await?;
    stream.flush().await?;

    let head = read_response_head(stream).await?;
    let status = parse_status(&head)?;

    tracing::trace!("HTTP proxy answered {} for CONNECT {}", status, target);

    match status {
        200..=299 => Ok(()),
        407 => Err(ProxyError::AuthFailed(
            "proxy answered 407 Proxy Authentication Required".to_string(),
        )),
        other => Err(ProxyError::Rejected(format!(
            "proxy answered HTTP {other} for CONNECT {target}"
        ))),
    }
}

async fn read_response_head<S>(stream: &mut S) -> Result<Vec<u8>, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ProxyError::Protocol(
                "proxy closed connection during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(ProxyError::Protocol(
                "proxy response head too large".to_string(),
            ));
        }
    }
}

fn parse_status(head: &[u8]) -> Result<u16, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => response
            .code
            .ok_or_else(|| ProxyError::Protocol("missing status code".to_string())),
        Ok(httparse::Status::Partial) => {
            Err(ProxyError::Protocol("incomplete response head".to_string()))
        }
        Err(e) => Err(ProxyError::Protocol(format!("invalid response: {e}"))),
    }
}
