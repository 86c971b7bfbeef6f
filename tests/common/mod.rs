//! Common utilities for integration tests
#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> SocketAddr {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Read an HTTP head byte by byte, leaving the body in the stream
pub async fn read_http_head<S>(stream: &mut S) -> Option<String>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => return None,
        }
    }
    String::from_utf8(head).ok()
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then_some(value.trim())
    })
}

/// A minimal upstream HTTP proxy that requires Basic credentials
#[derive(Clone)]
pub struct FakeProxy {
    pub addr: SocketAddr,
    expected_auth: Option<String>,
    greeting: Arc<Vec<u8>>,
    requests: Arc<Mutex<Vec<String>>>,
    tunnels: Arc<AtomicUsize>,
}

impl FakeProxy {
    /// Plain TCP upstream proxy
    pub async fn start(credentials: Option<(&str, &str)>, greeting: &[u8]) -> Self {
        Self::spawn(credentials, greeting, None).await
    }

    /// Upstream proxy behind TLS with a self-signed certificate
    pub async fn start_tls(credentials: Option<(&str, &str)>, greeting: &[u8]) -> Self {
        Self::spawn(credentials, greeting, Some(self_signed_acceptor())).await
    }

    async fn spawn(
        credentials: Option<(&str, &str)>,
        greeting: &[u8],
        acceptor: Option<TlsAcceptor>,
    ) -> Self {
        let listener = TokioTcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake proxy");
        let proxy = Self {
            addr: listener.local_addr().unwrap(),
            expected_auth: credentials
                .map(|(u, p)| format!("Basic {}", STANDARD.encode(format!("{}:{}", u, p)))),
            greeting: Arc::new(greeting.to_vec()),
            requests: Arc::new(Mutex::new(Vec::new())),
            tunnels: Arc::new(AtomicUsize::new(0)),
        };

        let server = proxy.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let server = server.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => {
                            if let Ok(stream) = acceptor.accept(socket).await {
                                server.handle(stream).await;
                            }
                        }
                        None => server.handle(socket).await,
                    }
                });
            }
        });

        proxy
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Request heads received so far
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    /// Number of CONNECT tunnels successfully established
    pub fn tunnels(&self) -> usize {
        self.tunnels.load(Ordering::SeqCst)
    }

    async fn handle<S>(&self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(head) = read_http_head(&mut stream).await else {
            return;
        };
        self.requests.lock().push(head.clone());

        if let Some(expected) = &self.expected_auth {
            if header_value(&head, "proxy-authorization") != Some(expected.as_str()) {
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                          Proxy-Authenticate: Basic realm=\"fake\"\r\n\
                          Content-Length: 0\r\n\r\n",
                    )
                    .await;
                return;
            }
        }

        let mut parts = head.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let target = parts.next().unwrap_or_default().to_string();

        if method == "CONNECT" {
            let Ok(mut remote) = TcpStream::connect(target.as_str()).await else {
                let _ = stream
                    .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                    .await;
                return;
            };
            let mut response = b"HTTP/1.1 200 Connection established\r\n\r\n".to_vec();
            response.extend_from_slice(&self.greeting);
            if stream.write_all(&response).await.is_err() {
                return;
            }
            self.tunnels.fetch_add(1, Ordering::SeqCst);
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut remote).await;
        } else {
            let body = format!("{} {}", method, target);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    }
}

fn self_signed_acceptor() -> TlsAcceptor {
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    let certified = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .expect("Failed to generate test certificate");
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.signing_key.serialize_der(),
    ));
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![certified.cert.der().clone()], key)
        .expect("Failed to build TLS server config");
    TlsAcceptor::from(Arc::new(config))
}

/// A CONNECT request received by [`FakeSocks`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub version: u8,
    pub user: String,
    pub host: String,
    pub port: u16,
    /// The target was sent as a host name rather than an address
    pub by_name: bool,
}

/// A minimal upstream SOCKS4/4a/5 proxy
#[derive(Clone)]
pub struct FakeSocks {
    pub addr: SocketAddr,
    credentials: Option<(String, String)>,
    requests: Arc<Mutex<Vec<SocksRequest>>>,
}

impl FakeSocks {
    /// SOCKS5 requires username/password when `credentials` is set,
    /// SOCKS4 requires the userid to match the username
    pub async fn start(credentials: Option<(&str, &str)>) -> Self {
        let listener = TokioTcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake SOCKS proxy");
        let proxy = Self {
            addr: listener.local_addr().unwrap(),
            credentials: credentials.map(|(u, p)| (u.to_string(), p.to_string())),
            requests: Arc::new(Mutex::new(Vec::new())),
        };

        let server = proxy.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let server = server.clone();
                tokio::spawn(async move {
                    let _ = server.handle(socket).await;
                });
            }
        });

        proxy
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// CONNECT requests accepted so far
    pub fn requests(&self) -> Vec<SocksRequest> {
        self.requests.lock().clone()
    }

    async fn handle(&self, mut socket: TcpStream) -> std::io::Result<()> {
        let version = socket.read_u8().await?;
        let request = match version {
            0x04 => self.socks4_request(&mut socket).await?,
            0x05 => self.socks5_request(&mut socket).await?,
            _ => None,
        };
        let Some(request) = request else {
            return Ok(());
        };

        let remote = TcpStream::connect((request.host.as_str(), request.port)).await;
        let success = remote.is_ok();
        if success {
            self.requests.lock().push(request);
        }
        let reply: &[u8] = match (version, success) {
            (0x04, true) => &[0x00, 0x5A, 0, 0, 0, 0, 0, 0],
            (0x04, false) => &[0x00, 0x5B, 0, 0, 0, 0, 0, 0],
            (_, true) => &[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0],
            (_, false) => &[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0],
        };
        socket.write_all(reply).await?;

        let Ok(mut remote) = remote else {
            return Ok(());
        };
        let _ = tokio::io::copy_bidirectional(&mut socket, &mut remote).await;
        Ok(())
    }

    async fn socks4_request(&self, socket: &mut TcpStream) -> std::io::Result<Option<SocksRequest>> {
        let mut header = [0u8; 7];
        socket.read_exact(&mut header).await?;
        let port = u16::from_be_bytes([header[1], header[2]]);
        let ip = [header[3], header[4], header[5], header[6]];
        let user = read_cstring(socket).await?;

        let by_name = ip[..3] == [0, 0, 0] && ip[3] != 0;
        let host = if by_name {
            read_cstring(socket).await?
        } else {
            std::net::Ipv4Addr::from(ip).to_string()
        };

        if let Some((expected, _)) = &self.credentials {
            if &user != expected {
                socket.write_all(&[0x00, 0x5D, 0, 0, 0, 0, 0, 0]).await?;
                return Ok(None);
            }
        }

        Ok(Some(SocksRequest {
            version: 4,
            user,
            host,
            port,
            by_name,
        }))
    }

    async fn socks5_request(&self, socket: &mut TcpStream) -> std::io::Result<Option<SocksRequest>> {
        let count = socket.read_u8().await?;
        let mut methods = vec![0u8; count as usize];
        socket.read_exact(&mut methods).await?;

        let mut user = String::new();
        match &self.credentials {
            Some((expected_user, expected_pass)) => {
                if !methods.contains(&0x02) {
                    socket.write_all(&[0x05, 0xFF]).await?;
                    return Ok(None);
                }
                socket.write_all(&[0x05, 0x02]).await?;

                let _auth_version = socket.read_u8().await?;
                let username = read_prefixed(socket).await?;
                let password = read_prefixed(socket).await?;
                if &username != expected_user || &password != expected_pass {
                    socket.write_all(&[0x01, 0x01]).await?;
                    return Ok(None);
                }
                socket.write_all(&[0x01, 0x00]).await?;
                user = username;
            }
            None => socket.write_all(&[0x05, 0x00]).await?,
        }

        let mut header = [0u8; 4];
        socket.read_exact(&mut header).await?;
        let (host, by_name) = match header[3] {
            0x01 => {
                let mut octets = [0u8; 4];
                socket.read_exact(&mut octets).await?;
                (std::net::Ipv4Addr::from(octets).to_string(), false)
            }
            0x04 => {
                let mut octets = [0u8; 16];
                socket.read_exact(&mut octets).await?;
                (std::net::Ipv6Addr::from(octets).to_string(), false)
            }
            0x03 => (read_prefixed(socket).await?, true),
            _ => return Ok(None),
        };
        let port = socket.read_u16().await?;

        Ok(Some(SocksRequest {
            version: 5,
            user,
            host,
            port,
            by_name,
        }))
    }
}

async fn read_cstring(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    loop {
        match socket.read_u8().await? {
            0 => break,
            byte => bytes.push(byte),
        }
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn read_prefixed(socket: &mut TcpStream) -> std::io::Result<String> {
    let len = socket.read_u8().await?;
    let mut bytes = vec![0u8; len as usize];
    socket.read_exact(&mut bytes).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Open a CONNECT tunnel through a local proxy, returning the stream and status code
pub async fn connect_through(proxy_url: &str, target: impl std::fmt::Display) -> (TcpStream, u16) {
    let proxy_addr = proxy_url.trim_start_matches("http://");
    let mut stream = TcpStream::connect(proxy_addr)
        .await
        .expect("Failed to connect to local proxy");
    let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = timeout(Duration::from_secs(5), read_http_head(&mut stream))
        .await
        .expect("Timed out waiting for CONNECT response")
        .expect("Local proxy closed before responding");
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("Malformed status line");
    (stream, status)
}

/// Write data and expect it echoed back
pub async fn assert_echo(stream: &mut TcpStream, data: &[u8]) {
    stream.write_all(data).await.unwrap();
    let mut buf = vec![0u8; data.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("Timed out waiting for echo")
        .unwrap();
    assert_eq!(buf, data);
}
