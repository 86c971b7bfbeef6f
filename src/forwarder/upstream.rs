/// 上游连接：HTTP(S) 代理 CONNECT 握手与 SOCKS 客户端握手
use rustls::pki_types::ServerName;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use super::http::{self, MAX_HEAD_SIZE};
use super::{BoxedStream, ConnectResponse, TunnelChannel};
use crate::descriptor::default_port;
use crate::error::ForwarderError;
use crate::tls;
use crate::uri::decode_uri_component_safe;

/// 上游代理类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    Http,
    Https,
    /// SOCKS4，目标地址本地解析
    Socks4,
    /// SOCKS4a，目标主机名交给代理解析
    Socks4a,
    /// SOCKS5，目标地址本地解析
    Socks5,
    /// SOCKS5，目标主机名交给代理解析（`socks5h` 和 `socks`）
    Socks5h,
}

impl UpstreamScheme {
    pub fn is_socks(self) -> bool {
        !matches!(self, Self::Http | Self::Https)
    }
}

impl fmt::Display for UpstreamScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
            Self::Socks4 => write!(f, "socks4"),
            Self::Socks4a => write!(f, "socks4a"),
            Self::Socks5 => write!(f, "socks5"),
            Self::Socks5h => write!(f, "socks5h"),
        }
    }
}

impl FromStr for UpstreamScheme {
    type Err = ForwarderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "socks4" => Ok(Self::Socks4),
            "socks4a" => Ok(Self::Socks4a),
            "socks5" => Ok(Self::Socks5),
            "socks5h" | "socks" => Ok(Self::Socks5h),
            _ => Err(ForwarderError::upstream(format!(
                "Unsupported upstream proxy scheme: {}",
                s
            ))),
        }
    }
}

/// 解析后的上游代理
#[derive(Debug, Clone)]
pub struct Upstream {
    pub scheme: UpstreamScheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ignore_certificate: bool,
}

impl Upstream {
    pub fn from_url(url: &Url, ignore_certificate: bool) -> Result<Self, ForwarderError> {
        let scheme: UpstreamScheme = url.scheme().parse()?;
        let host = url
            .host_str()
            .ok_or_else(|| ForwarderError::upstream("Upstream proxy URL has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port()
            .or_else(|| default_port(url.scheme()))
            .ok_or_else(|| ForwarderError::upstream("Upstream proxy URL has no port"))?;

        let username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(decode_uri_component_safe);
        let password = url
            .password()
            .filter(|p| !p.is_empty())
            .map(decode_uri_component_safe);

        Ok(Self {
            scheme,
            host,
            port,
            username,
            password,
            ignore_certificate,
        })
    }

    fn has_credentials(&self) -> bool {
        self.username.is_some() || self.password.is_some()
    }

    /// `Proxy-Authorization` 头的值
    pub fn proxy_authorization(&self) -> Option<String> {
        if !self.has_credentials() {
            return None;
        }
        Some(http::basic_auth(
            self.username.as_deref().unwrap_or(""),
            self.password.as_deref().unwrap_or(""),
        ))
    }

    fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// 上游 CONNECT 成功后的隧道
pub struct HttpTunnel {
    pub stream: BoxedStream,
    pub response: ConnectResponse,
    /// 响应头之后已读取的字节
    pub head: Vec<u8>,
    pub channel: TunnelChannel,
}

/// 带超时的 TCP 连接
pub async fn connect_tcp(addr: &str, connect_timeout: Duration) -> Result<TcpStream, ForwarderError> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ForwarderError::timeout(connect_timeout))?
        .map_err(|e| ForwarderError::upstream(format!("Failed to connect to {}: {}", addr, e)))?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
    Ok(stream)
}

/// 连接到 HTTP(S) 上游代理，https 时完成 TLS 握手
pub async fn connect_http_proxy(
    upstream: &Upstream,
    connection_id: u64,
    connect_timeout: Duration,
) -> Result<(BoxedStream, TunnelChannel), ForwarderError> {
    let tcp = connect_tcp(&upstream.addr(), connect_timeout).await?;
    let mut channel = TunnelChannel {
        connection_id,
        local_addr: tcp.local_addr().ok(),
        peer_addr: tcp.peer_addr().ok(),
        tls: false,
    };

    if upstream.scheme != UpstreamScheme::Https {
        return Ok((Box::new(tcp), channel));
    }

    let server_name = ServerName::try_from(upstream.host.clone()).map_err(|e| {
        ForwarderError::upstream(format!("Invalid upstream server name '{}': {}", upstream.host, e))
    })?;
    let connector = TlsConnector::from(tls::client_config(upstream.ignore_certificate));
    let tls_stream = timeout(connect_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| ForwarderError::timeout(connect_timeout))?
        .map_err(|e| ForwarderError::upstream(format!("TLS handshake with upstream failed: {}", e)))?;

    channel.tls = true;
    Ok((Box::new(tls_stream), channel))
}

/// 通过 HTTP(S) 上游代理建立 CONNECT 隧道
///
/// 非 200 响应同样以 Ok 返回，由调用方决定如何回复客户端。
pub async fn connect_http_tunnel(
    upstream: &Upstream,
    target: &str,
    connection_id: u64,
    connect_timeout: Duration,
) -> Result<HttpTunnel, ForwarderError> {
    let (mut stream, channel) = connect_http_proxy(upstream, connection_id, connect_timeout).await?;

    let request = http::build_connect_request(target, upstream.proxy_authorization().as_deref());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let (head_bytes, head) = timeout(connect_timeout, http::read_head(&mut stream, MAX_HEAD_SIZE))
        .await
        .map_err(|_| ForwarderError::timeout(connect_timeout))??;
    let response = http::parse_response(&head_bytes)?;

    debug!(
        "Connection #{}: upstream CONNECT {} responded {} {}",
        connection_id, target, response.status, response.reason
    );

    Ok(HttpTunnel {
        stream,
        response,
        head,
        channel,
    })
}

/// 通过 SOCKS 上游代理连接目标
pub async fn connect_socks(
    upstream: &Upstream,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, ForwarderError> {
    let mut stream = connect_tcp(&upstream.addr(), connect_timeout).await?;

    let handshake = async {
        match upstream.scheme {
            UpstreamScheme::Socks4 | UpstreamScheme::Socks4a => {
                socks4_connect(&mut stream, upstream, target_host, target_port).await
            }
            UpstreamScheme::Socks5 | UpstreamScheme::Socks5h => {
                socks5_connect(&mut stream, upstream, target_host, target_port).await
            }
            other => Err(ForwarderError::upstream(format!(
                "{} is not a SOCKS scheme",
                other
            ))),
        }
    };

    timeout(connect_timeout, handshake)
        .await
        .map_err(|_| ForwarderError::timeout(connect_timeout))??;

    Ok(stream)
}

/// 本地解析目标地址
async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ForwarderError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    lookup_host((host, port))
        .await
        .map_err(|e| ForwarderError::upstream(format!("Failed to resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| ForwarderError::upstream(format!("No address found for {}", host)))
}

async fn socks4_connect(
    stream: &mut TcpStream,
    upstream: &Upstream,
    host: &str,
    port: u16,
) -> Result<(), ForwarderError> {
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&port.to_be_bytes());

    let remote_host = match upstream.scheme {
        UpstreamScheme::Socks4 => {
            let ipv4 = match resolve(host, port).await? {
                SocketAddr::V4(addr) => *addr.ip(),
                SocketAddr::V6(_) => {
                    return Err(ForwarderError::upstream(format!(
                        "SOCKS4 cannot connect to IPv6 target {}",
                        host
                    )))
                }
            };
            request.extend_from_slice(&ipv4.octets());
            None
        }
        _ => match host.parse::<std::net::Ipv4Addr>() {
            Ok(ipv4) => {
                request.extend_from_slice(&ipv4.octets());
                None
            }
            Err(_) => {
                // SOCKS4a：0.0.0.x 表示主机名跟在 userid 后面
                request.extend_from_slice(&[0, 0, 0, 1]);
                Some(host)
            }
        },
    };

    request.extend_from_slice(upstream.username.as_deref().unwrap_or("").as_bytes());
    request.push(0x00);
    if let Some(remote_host) = remote_host {
        request.extend_from_slice(remote_host.as_bytes());
        request.push(0x00);
    }

    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x5A {
        return Err(ForwarderError::upstream(format!(
            "SOCKS4 proxy rejected connection to {}:{} (code 0x{:02x})",
            host, port, reply[1]
        )));
    }
    Ok(())
}

async fn socks5_connect(
    stream: &mut TcpStream,
    upstream: &Upstream,
    host: &str,
    port: u16,
) -> Result<(), ForwarderError> {
    // 1. 协商认证方法
    let greeting: &[u8] = if upstream.has_credentials() {
        &[0x05, 0x02, 0x00, 0x02]
    } else {
        &[0x05, 0x01, 0x00]
    };
    stream.write_all(greeting).await?;
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != 0x05 {
        return Err(ForwarderError::upstream(format!(
            "Unsupported SOCKS version from upstream: {}",
            choice[0]
        )));
    }

    match choice[1] {
        0x00 => {}
        0x02 => {
            // 2. 用户名/密码认证 (RFC 1929)
            let username = upstream.username.as_deref().unwrap_or("").as_bytes();
            let password = upstream.password.as_deref().unwrap_or("").as_bytes();
            if username.len() > 255 || password.len() > 255 {
                return Err(ForwarderError::upstream(
                    "SOCKS5 username and password must be at most 255 bytes",
                ));
            }

            let mut auth = vec![0x01, username.len() as u8];
            auth.extend_from_slice(username);
            auth.push(password.len() as u8);
            auth.extend_from_slice(password);
            stream.write_all(&auth).await?;
            stream.flush().await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(ForwarderError::upstream(
                    "SOCKS5 upstream proxy authentication failed",
                ));
            }
        }
        0xFF => {
            return Err(ForwarderError::upstream(
                "SOCKS5 upstream proxy accepted none of the offered authentication methods",
            ))
        }
        other => {
            return Err(ForwarderError::upstream(format!(
                "SOCKS5 upstream proxy selected unsupported method 0x{:02x}",
                other
            )))
        }
    }

    // 3. CONNECT 请求
    let mut request = vec![0x05, 0x01, 0x00];
    let literal_ip = host.parse::<IpAddr>().ok();
    let address = match (upstream.scheme, literal_ip) {
        (_, Some(ip)) => Some(ip),
        (UpstreamScheme::Socks5, None) => Some(resolve(host, port).await?.ip()),
        _ => None,
    };

    match address {
        Some(IpAddr::V4(ipv4)) => {
            request.push(0x01);
            request.extend_from_slice(&ipv4.octets());
        }
        Some(IpAddr::V6(ipv6)) => {
            request.push(0x04);
            request.extend_from_slice(&ipv6.octets());
        }
        None => {
            if host.len() > 255 {
                return Err(ForwarderError::upstream(format!(
                    "SOCKS5 domain name too long: {}",
                    host
                )));
            }
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());

    stream.write_all(&request).await?;
    stream.flush().await?;

    // 4. 读取响应并跳过 BND.ADDR / BND.PORT
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(ForwarderError::upstream(format!(
            "SOCKS5 proxy rejected connection to {}:{} (code 0x{:02x})",
            host, port, reply[1]
        )));
    }

    let addr_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        atyp => {
            return Err(ForwarderError::upstream(format!(
                "Unsupported SOCKS5 address type in reply: {}",
                atyp
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}
