//! Proxy transport layer
//!
//! Establishes the TCP hop to the upstream endpoint through a forward proxy,
//! via HTTP CONNECT or SOCKS.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};

use crate::error::{FarmError, Result};
use crate::models::ProxyEndpoint;

/// Proxy transport handler
pub struct ProxyTransport;

impl ProxyTransport {
    /// Connect to `target_host:target_port` through the given proxy
    #[instrument(skip(proxy), fields(proxy = %proxy, target = %target_host))]
    pub async fn connect(
        proxy: &ProxyEndpoint,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        let proxy_addr = format_tcp_addr(&proxy.host, proxy.port);

        if proxy.protocol.is_http() {
            connect_via_http_proxy(proxy, &proxy_addr, target_host, target_port)
                .await
                .map_err(|e| {
                    FarmError::ProxyConnectionFailed(format!(
                        "HTTP proxy connect failed ({} -> {}:{}): {}",
                        proxy_addr, target_host, target_port, e
                    ))
                })
        } else {
            // SOCKS4/4a endpoints are dialed with the SOCKS5 client as well.
            connect_via_socks_proxy(proxy, &proxy_addr, target_host, target_port)
                .await
                .map_err(|e| {
                    FarmError::ProxyConnectionFailed(format!(
                        "SOCKS proxy connect failed ({} -> {}:{}): {}",
                        proxy_addr, target_host, target_port, e
                    ))
                })
        }
    }
}

async fn connect_via_http_proxy(
    proxy: &ProxyEndpoint,
    proxy_addr: &str,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let mut stream = TcpStream::connect(proxy_addr).await?;

    let authority = format_tcp_addr(target_host, target_port);
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

    if let Some(username) = &proxy.username {
        let password = proxy.password.as_deref().unwrap_or("");
        let credentials = format!("{}:{}", username, password);
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials.as_bytes())
        ));
    }

    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = vec![0u8; 1024];
    let n = stream.read(&mut response).await?;
    if n == 0 {
        anyhow::bail!("empty CONNECT response");
    }

    let response_str = String::from_utf8_lossy(&response[..n]);
    if !response_str.starts_with("HTTP/1.1 200") && !response_str.starts_with("HTTP/1.0 200") {
        anyhow::bail!(
            "CONNECT failed: {}",
            response_str.lines().next().unwrap_or("Unknown error")
        );
    }

    debug!("HTTP CONNECT tunnel established");
    Ok(stream)
}

async fn connect_via_socks_proxy(
    proxy: &ProxyEndpoint,
    proxy_addr: &str,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let socket = TcpStream::connect(proxy_addr).await?;

    let stream = match (&proxy.username, &proxy.password) {
        (Some(username), Some(password)) => {
            Socks5Stream::connect_with_password_and_socket(
                socket,
                (target_host, target_port),
                username,
                password,
            )
            .await?
        }
        _ => Socks5Stream::connect_with_socket(socket, (target_host, target_port)).await?,
    };

    debug!("SOCKS tunnel established");
    Ok(stream.into_inner())
}

fn format_tcp_addr(host: &str, port: u16) -> String {
    // Bare IPv6 addresses need brackets for ToSocketAddrs.
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
