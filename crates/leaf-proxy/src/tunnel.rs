//! Opening TCP tunnels through a proxy directive.

use crate::directive::{ProxyDirective, ProxyScheme};
use crate::error::ProxyError;
use crate::{http_connect, socks5};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time;

/// Dial the proxy and open a tunnel to `target_host:target_port`
///
/// The proxy host is resolved here, at connection time. The target host is
/// handed to the proxy unresolved. `timeout` bounds the dial plus handshake.
///
/// # Errors
///
/// Returns [`ProxyError::Timeout`] when the deadline passes, otherwise the
/// error of the failing step.
pub async fn open_tunnel(
    directive: &ProxyDirective,
    target_host: &str,
    target_port: u16,
    timeout: Duration,
) -> Result<TcpStream, ProxyError> {
    time::timeout(timeout, async {
        let mut stream = TcpStream::connect((directive.host(), directive.port())).await?;
        stream.set_nodelay(true)?;

        match directive.scheme() {
            ProxyScheme::Http => {
                let target = if target_host.contains(':') {
                    format!("[{target_host}]:{target_port}")
                } else {
                    format!("{target_host}:{target_port}")
                };
                http_connect::handshake(&mut stream, &target, directive.credentials()).await?;
            }
            ProxyScheme::Socks5 => {
                socks5::handshake(
                    &mut stream,
                    target_host,
                    target_port,
                    directive.credentials(),
                )
                .await?;
            }
        }

        tracing::debug!(
            "Tunnel to {}:{} open via {}",
            target_host,
            target_port,
            directive
        );
        Ok::<_, ProxyError>(stream)
    })
    .await
    .map_err(|_| ProxyError::Timeout)?
}
