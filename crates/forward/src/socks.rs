//! Server side of the SOCKS handshake for dynamic forwards.
//!
//! Supports SOCKS4 (IPv4 CONNECT), SOCKS4a (hostname CONNECT) and SOCKS5
//! (RFC 1928, no authentication, CONNECT, IPv4/IPv6/domain). Anything else
//! gets the protocol's failure reply before the error is returned.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS5_VERSION: u8 = 0x05;

const CMD_CONNECT: u8 = 0x01;

const SOCKS4_GRANTED: u8 = 0x5A;
const SOCKS4_REJECTED: u8 = 0x5B;

const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_CMD_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// Longest user id or hostname accepted in a SOCKS4 request.
const MAX_SOCKS4_FIELD: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

/// A CONNECT request that passed the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub version: SocksVersion,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("unsupported SOCKS version {0}")]
    Version(u8),
    #[error("no acceptable authentication method")]
    NoAcceptableAuth,
    #[error("unsupported SOCKS command {0}")]
    Command(u8),
    #[error("unsupported address type {0}")]
    AddressType(u8),
    #[error("malformed request: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read a client's greeting and request.
///
/// On success the caller must answer with [`reply`] once the target is
/// reachable (or not).
pub async fn accept<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match stream.read_u8().await? {
        SOCKS4_VERSION => accept_v4(stream).await,
        SOCKS5_VERSION => accept_v5(stream).await,
        other => Err(SocksError::Version(other)),
    }
}

/// Tell the client whether its CONNECT went through.
pub async fn reply<S>(stream: &mut S, version: SocksVersion, granted: bool) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V4 => {
            let code = if granted { SOCKS4_GRANTED } else { SOCKS4_REJECTED };
            stream.write_all(&[0x00, code, 0, 0, 0, 0, 0, 0]).await
        }
        SocksVersion::V5 => {
            let code = if granted {
                REPLY_SUCCESS
            } else {
                REPLY_GENERAL_FAILURE
            };
            write_v5_reply(stream, code).await
        }
    }
}

async fn write_v5_reply<S: AsyncWrite + Unpin>(stream: &mut S, code: u8) -> io::Result<()> {
    // Bound address is meaningless for CONNECT; report 0.0.0.0:0.
    stream
        .write_all(&[SOCKS5_VERSION, code, 0x00, ADDR_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

async fn accept_v4<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let command = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut ip = [0u8; 4];
    stream.read_exact(&mut ip).await?;
    let _user_id = read_nul_terminated(stream).await?;

    if command != CMD_CONNECT {
        reply(stream, SocksVersion::V4, false).await?;
        return Err(SocksError::Command(command));
    }

    // SOCKS4a: 0.0.0.x with x != 0 means a hostname follows the user id.
    let host = if ip[..3] == [0, 0, 0] && ip[3] != 0 {
        let host = read_nul_terminated(stream).await?;
        if host.is_empty() {
            reply(stream, SocksVersion::V4, false).await?;
            return Err(SocksError::Malformed("empty hostname"));
        }
        host
    } else {
        Ipv4Addr::from(ip).to_string()
    };

    Ok(SocksRequest {
        version: SocksVersion::V4,
        host,
        port,
    })
}

async fn read_nul_terminated<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, SocksError> {
    let mut bytes = Vec::new();
    loop {
        match stream.read_u8().await? {
            0 => break,
            byte if bytes.len() < MAX_SOCKS4_FIELD => bytes.push(byte),
            _ => return Err(SocksError::Malformed("field too long")),
        }
    }
    String::from_utf8(bytes).map_err(|_| SocksError::Malformed("field is not UTF-8"))
}

async fn accept_v5<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method_count = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; method_count];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(SocksError::NoAcceptableAuth);
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, address_type] = header;
    if version != SOCKS5_VERSION {
        return Err(SocksError::Version(version));
    }
    if command != CMD_CONNECT {
        write_v5_reply(stream, REPLY_CMD_NOT_SUPPORTED).await?;
        return Err(SocksError::Command(command));
    }

    let host = match address_type {
        ADDR_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        ADDR_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
        ADDR_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            match String::from_utf8(domain) {
                Ok(domain) if !domain.is_empty() => domain,
                _ => {
                    write_v5_reply(stream, REPLY_GENERAL_FAILURE).await?;
                    return Err(SocksError::Malformed("bad domain name"));
                }
            }
        }
        other => {
            write_v5_reply(stream, REPLY_ADDR_NOT_SUPPORTED).await?;
            return Err(SocksError::AddressType(other));
        }
    };
    let port = stream.read_u16().await?;

    Ok(SocksRequest {
        version: SocksVersion::V5,
        host,
        port,
    })
}
