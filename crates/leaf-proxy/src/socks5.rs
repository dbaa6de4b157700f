//! SOCKS5 `CONNECT` handshake (RFC 1928, username/password auth per RFC 1929).

use crate::directive::Credentials;
use crate::error::ProxyError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VER_SOCKS5: u8 = 0x05;
const VER_AUTH: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_INVALID: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const RESULT_SUCCESS: u8 = 0x00;

/// Human-readable text for a SOCKS5 reply code
#[must_use]
pub fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

/// Encode the destination address of a CONNECT request
///
/// IP literals use their native address types; anything else is sent as a
/// domain name so the proxy resolves it.
fn encode_target(host: &str, port: u16) -> Result<Vec<u8>, ProxyError> {
    let mut out = Vec::with_capacity(host.len() + 4);
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len()).map_err(|_| {
                ProxyError::Protocol(format!("target host too long for SOCKS5: {host}"))
            })?;
            out.push(ATYP_DOMAIN);
            out.push(len);
            out.extend_from_slice(host.as_bytes());
        }
    }
    out.extend_from_slice(&port.to_be_bytes());
    Ok(out)
}

fn encode_auth(credentials: &Credentials) -> Result<Vec<u8>, ProxyError> {
    let user = credentials.username().as_bytes();
    let pass = credentials.password().as_bytes();
    let (Ok(ulen), Ok(plen)) = (u8::try_from(user.len()), u8::try_from(pass.len())) else {
        return Err(ProxyError::AuthFailed(
            "SOCKS5 credentials longer than 255 bytes".to_string(),
        ));
    };
    let mut out = Vec::with_capacity(3 + user.len() + pass.len());
    out.push(VER_AUTH);
    out.push(ulen);
    out.extend_from_slice(user);
    out.push(plen);
    out.extend_from_slice(pass);
    Ok(out)
}

/// Perform the SOCKS5 handshake on an already-connected proxy stream
///
/// Returns the bound address reported by the proxy.
///
/// # Errors
///
/// - [`ProxyError::AuthFailed`] if the proxy refuses every offered method or
///   rejects the credentials
/// - [`ProxyError::Rejected`] if the CONNECT command fails
/// - [`ProxyError::Protocol`] on malformed replies
pub async fn handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<&Credentials>,
) -> Result<(String, u16), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting
    let greeting: &[u8] = if credentials.is_some() {
        &[VER_SOCKS5, 2, METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[VER_SOCKS5, 1, METHOD_NO_AUTH]
    };
    stream.write_all(greeting).await?;
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VER_SOCKS5 {
        return Err(ProxyError::Protocol(format!(
            "unsupported SOCKS version: {}",
            choice[0]
        )));
    }

    match (choice[1], credentials) {
        (METHOD_NO_AUTH, _) => {}
        (METHOD_USER_PASS, Some(creds)) => {
            stream.write_all(&encode_auth(creds)?).await?;
            stream.flush().await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[0] != VER_AUTH {
                return Err(ProxyError::Protocol(
                    "unsupported SOCKS auth version".to_string(),
                ));
            }
            if status[1] != RESULT_SUCCESS {
                return Err(ProxyError::AuthFailed(format!(
                    "SOCKS server rejected credentials: status {}",
                    status[1]
                )));
            }
        }
        (METHOD_INVALID, _) => {
            return Err(ProxyError::AuthFailed(
                "SOCKS server rejected all offered auth methods".to_string(),
            ));
        }
        (other, _) => {
            return Err(ProxyError::Protocol(format!(
                "SOCKS server selected unoffered auth method {other:#04x}"
            )));
        }
    }

    // CONNECT request
    let mut request = vec![VER_SOCKS5, CMD_CONNECT, 0x00];
    request.extend_from_slice(&encode_target(host, port)?);
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VER_SOCKS5 {
        return Err(ProxyError::Protocol(format!(
            "unsupported SOCKS version: {}",
            reply[0]
        )));
    }
    if reply[1] != RESULT_SUCCESS {
        return Err(ProxyError::Rejected(format!(
            "SOCKS connect to {host}:{port} failed: {} ({:#04x})",
            reply_message(reply[1]),
            reply[1]
        )));
    }
    if reply[2] != 0 {
        return Err(ProxyError::Protocol(
            "SOCKS server responded with invalid reserved byte".to_string(),
        ));
    }

    let bound = read_bound_address(stream, reply[3]).await?;

    tracing::trace!("SOCKS5 tunnel to {}:{} bound at {}:{}", host, port, bound.0, bound.1);

    Ok(bound)
}

async fn read_bound_address<S>(stream: &mut S, atyp: u8) -> Result<(String, u16), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        other => {
            return Err(ProxyError::Protocol(format!(
                "unknown SOCKS address type {other:#04x}"
            )));
        }
    };
    let port = stream.read_u16().await?;
    Ok((host, port))
}
