/// 上游转发服务器
///
/// 在本地监听一个不需要认证的 HTTP 代理端口，将每个入站连接
/// 通过上游代理（HTTP、HTTPS 或 SOCKS）转发出去。
mod http;
mod relay;
mod upstream;

pub use http::{basic_auth, parse_basic_auth, RequestHead};
pub use upstream::{Upstream, UpstreamScheme};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ForwarderLimits;
use crate::error::ForwarderError;
use crate::uri::redact_url;
use http::{RequestForm, MAX_HEAD_SIZE};
use upstream::HttpTunnel;

/// 转发服务器支持的 SOCKS 协议标识
pub const SOCKS_SCHEMES: &[&str] = &["socks", "socks4", "socks4a", "socks5", "socks5h"];

/// 407 响应中使用的认证域
const AUTH_REALM: &str = "proxy-anonymizer";

/// 双向字节流抽象（TCP 或 TLS）
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn Transport>;

/// 交给请求决策回调的入站请求信息
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub connection_id: u64,
    pub peer_addr: SocketAddr,
    pub method: String,
    pub target: String,
    /// 入站 `Proxy-Authorization: Basic` 中的用户名
    pub username: Option<String>,
    pub password: Option<String>,
}

/// 请求决策：是否要求入站认证，以及使用哪个上游
#[derive(Debug, Clone, Default)]
pub struct PrepareDecision {
    pub request_authentication: bool,
    /// 为 None 时直接连接目标
    pub upstream_proxy_url: Option<Url>,
    pub ignore_upstream_proxy_certificate: bool,
}

/// 每个请求调用一次的决策回调
pub type PrepareFn = Arc<dyn Fn(&RequestInfo) -> PrepareDecision + Send + Sync>;

/// 转发服务器配置
#[derive(Clone)]
pub struct ForwarderConfig {
    pub host: String,
    pub port: u16,
    pub prepare: PrepareFn,
    pub limits: ForwarderLimits,
}

impl ForwarderConfig {
    pub fn new(host: impl Into<String>, port: u16, prepare: PrepareFn) -> Self {
        Self {
            host: host.into(),
            port,
            prepare,
            limits: ForwarderLimits::from_env(),
        }
    }

    /// 固定转发到一个上游、从不要求入站认证的配置
    pub fn anonymous(port: u16, upstream_proxy_url: Url, ignore_certificate: bool) -> Self {
        let decision = PrepareDecision {
            request_authentication: false,
            upstream_proxy_url: Some(upstream_proxy_url),
            ignore_upstream_proxy_certificate: ignore_certificate,
        };
        Self::new(
            "127.0.0.1",
            port,
            Arc::new(move |_: &RequestInfo| decision.clone()),
        )
    }

    pub fn with_limits(mut self, limits: ForwarderLimits) -> Self {
        self.limits = limits;
        self
    }
}

impl std::fmt::Debug for ForwarderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwarderConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// 上游对 CONNECT 的响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

/// 承载隧道流量的上游连接的元数据视图
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelChannel {
    pub connection_id: u64,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    /// 到上游的连接是否经过 TLS
    pub tls: bool,
}

/// "上游 CONNECT 已响应" 事件
///
/// 观察者拿到的是连接的只读视图（[`TunnelChannel`] 加上预读字节），
/// 而不是流本身；字节流始终由转发器独占并中继给客户端。
#[derive(Debug)]
pub struct TunnelConnectResponded<'a> {
    pub response: &'a ConnectResponse,
    pub channel: &'a TunnelChannel,
    /// 上游在响应头之后已发送、尚未转发给客户端的字节
    pub head: &'a [u8],
}

pub type TunnelObserver = Arc<dyn Fn(&TunnelConnectResponded<'_>) + Send + Sync>;

/// 转发服务器接口
#[async_trait]
pub trait ForwardingServer: Send + Sync {
    /// 实际监听的端口
    fn port(&self) -> u16;

    /// 订阅 "上游 CONNECT 已响应" 事件
    fn on_tunnel_connect_responded(&self, observer: TunnelObserver);

    /// 关闭服务器；`force` 为 true 时立即断开进行中的连接
    async fn close(&self, force: bool) -> Result<(), ForwarderError>;
}

/// 转发服务器工厂：构造并开始监听
#[async_trait]
pub trait ServerFactory: Send + Sync {
    async fn start(
        &self,
        config: ForwarderConfig,
    ) -> Result<Arc<dyn ForwardingServer>, ForwarderError>;
}

/// 默认工厂，创建 [`UpstreamForwarder`]
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpServerFactory;

#[async_trait]
impl ServerFactory for TcpServerFactory {
    async fn start(
        &self,
        config: ForwarderConfig,
    ) -> Result<Arc<dyn ForwardingServer>, ForwarderError> {
        let server = UpstreamForwarder::listen(config).await?;
        Ok(Arc::new(server))
    }
}

/// 连接处理任务共享的状态
struct Shared {
    config: ForwarderConfig,
    observers: RwLock<Vec<TunnelObserver>>,
    next_connection_id: AtomicU64,
}

impl Shared {
    fn emit_tunnel_connect_responded(&self, event: &TunnelConnectResponded<'_>) {
        // 先复制一份，回调里再订阅也不会死锁
        let observers = self.observers.read().clone();
        for observer in observers {
            observer(event);
        }
    }
}

/// 基于 tokio 的转发服务器
pub struct UpstreamForwarder {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    /// 停止接受新连接
    shutdown: CancellationToken,
    /// 中断进行中的连接
    force_disconnect: CancellationToken,
    tracker: TaskTracker,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl UpstreamForwarder {
    /// 绑定并开始监听
    pub async fn listen(config: ForwarderConfig) -> Result<Self, ForwarderError> {
        let bind_addr = if config.host.contains(':') {
            format!("[{}]:{}", config.host, config.port)
        } else {
            format!("{}:{}", config.host, config.port)
        };

        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| ForwarderError::bind(bind_addr.clone(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ForwarderError::bind(bind_addr.clone(), e))?;

        info!("Forwarder: Listening on {}", local_addr);

        let shared = Arc::new(Shared {
            config,
            observers: RwLock::new(Vec::new()),
            next_connection_id: AtomicU64::new(1),
        });
        let shutdown = CancellationToken::new();
        let force_disconnect = CancellationToken::new();
        let tracker = TaskTracker::new();

        let accept_task = tokio::spawn(run_accept_loop(
            listener,
            shared.clone(),
            shutdown.clone(),
            force_disconnect.clone(),
            tracker.clone(),
        ));

        Ok(Self {
            local_addr,
            shared,
            shutdown,
            force_disconnect,
            tracker,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 当前进行中的连接数
    pub fn active_connections(&self) -> usize {
        self.tracker.len()
    }
}

#[async_trait]
impl ForwardingServer for UpstreamForwarder {
    fn port(&self) -> u16 {
        self.local_addr.port()
    }

    fn on_tunnel_connect_responded(&self, observer: TunnelObserver) {
        self.shared.observers.write().push(observer);
    }

    async fn close(&self, force: bool) -> Result<(), ForwarderError> {
        let accept_task = self.accept_task.lock().take();
        let Some(accept_task) = accept_task else {
            // 另一个 close 正在等待连接结束，强制关闭仍要立即断开它们
            if force {
                self.force_disconnect.cancel();
                self.tracker.wait().await;
            }
            debug!("Forwarder {}: already closed", self.local_addr);
            return Ok(());
        };

        info!(
            "Forwarder {}: Closing ({} active connections, force={})",
            self.local_addr,
            self.tracker.len(),
            force
        );

        self.shutdown.cancel();
        if force {
            self.force_disconnect.cancel();
        }

        accept_task
            .await
            .map_err(|e| ForwarderError::Shutdown(format!("accept loop failed: {}", e)))?;

        self.tracker.close();
        self.tracker.wait().await;

        info!("Forwarder {}: Closed", self.local_addr);
        Ok(())
    }
}

impl Drop for UpstreamForwarder {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.force_disconnect.cancel();
    }
}

/// 接受连接直到收到关闭信号
async fn run_accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    force_disconnect: CancellationToken,
    tracker: TaskTracker,
) {
    let connection_limiter = Arc::new(Semaphore::new(shared.config.limits.max_connections));

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Forwarder: Accept loop stopped");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }

                        let permit = match connection_limiter.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!(
                                    "Forwarder: Connection limit reached ({}), rejecting connection from {}",
                                    shared.config.limits.max_connections, peer_addr
                                );
                                drop(stream);
                                continue;
                            }
                        };

                        let connection_id = shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
                        debug!("Connection #{}: Accepted from {}", connection_id, peer_addr);

                        let shared = shared.clone();
                        let force_disconnect = force_disconnect.clone();
                        tracker.spawn(async move {
                            let _permit = permit;
                            tokio::select! {
                                _ = force_disconnect.cancelled() => {
                                    debug!("Connection #{}: Forcibly closed", connection_id);
                                }
                                result = handle_connection(stream, peer_addr, connection_id, &shared) => {
                                    if let Err(e) = result {
                                        warn!("Connection #{}: {}", connection_id, e);
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Forwarder: Accept error: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

/// 处理一个入站连接
async fn handle_connection(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    connection_id: u64,
    shared: &Shared,
) -> Result<(), ForwarderError> {
    let limits = shared.config.limits;

    let read = http::read_head(&mut client, MAX_HEAD_SIZE);
    let (head_bytes, leftover) = timeout(limits.parse_timeout, read)
        .await
        .map_err(|_| ForwarderError::timeout(limits.parse_timeout))??;

    let request = match http::parse_request(&head_bytes) {
        Ok(request) => request,
        Err(e) => {
            let response = http::error_response(400, "Bad Request", &e.to_string());
            client.write_all(&response).await.ok();
            return Err(e);
        }
    };

    let (username, password) = match request
        .header("proxy-authorization")
        .and_then(http::parse_basic_auth)
    {
        Some((u, p)) => (Some(u), Some(p)),
        None => (None, None),
    };

    let info = RequestInfo {
        connection_id,
        peer_addr,
        method: request.method.clone(),
        target: request.target.clone(),
        username,
        password,
    };
    let decision = (shared.config.prepare)(&info);

    if decision.request_authentication {
        debug!("Connection #{}: Requesting proxy authentication", connection_id);
        client
            .write_all(&http::auth_required_response(AUTH_REALM))
            .await?;
        return Ok(());
    }

    let upstream = match &decision.upstream_proxy_url {
        Some(url) => Some(Upstream::from_url(
            url,
            decision.ignore_upstream_proxy_certificate,
        )?),
        None => None,
    };

    debug!(
        "Connection #{}: {} {} via {}",
        connection_id,
        request.method,
        request.target,
        decision
            .upstream_proxy_url
            .as_ref()
            .map(redact_url)
            .unwrap_or_else(|| "direct".to_string())
    );

    let result = if request.is_connect() {
        handle_connect(
            &mut client,
            &request,
            leftover,
            upstream.as_ref(),
            connection_id,
            shared,
        )
        .await
    } else {
        handle_forward(&mut client, &request, leftover, upstream.as_ref(), limits).await
    };

    debug!("Connection #{}: Closed", connection_id);
    result
}

/// 向客户端返回错误并把错误继续向上传递
async fn fail_with<S>(client: &mut S, status: u16, reason: &str, err: ForwarderError) -> ForwarderError
where
    S: AsyncWrite + Unpin,
{
    let response = http::error_response(status, reason, &err.to_string());
    client.write_all(&response).await.ok();
    err
}

/// CONNECT 隧道
async fn handle_connect(
    client: &mut TcpStream,
    request: &RequestHead,
    leftover: Vec<u8>,
    upstream: Option<&Upstream>,
    connection_id: u64,
    shared: &Shared,
) -> Result<(), ForwarderError> {
    let limits = shared.config.limits;
    let target = request.target.as_str();
    let (host, port) = match http::split_host_port(target) {
        Ok(parts) => parts,
        Err(e) => return Err(fail_with(client, 400, "Bad Request", e).await),
    };

    let (mut remote, head): (BoxedStream, Vec<u8>) = match upstream {
        None => match upstream::connect_tcp(target, limits.connect_timeout).await {
            Ok(stream) => (Box::new(stream) as BoxedStream, Vec::new()),
            Err(e) => return Err(fail_with(client, 502, "Bad Gateway", e).await),
        },
        Some(up) if up.scheme.is_socks() => {
            match upstream::connect_socks(up, &host, port, limits.connect_timeout).await {
                Ok(stream) => (Box::new(stream) as BoxedStream, Vec::new()),
                Err(e) => return Err(fail_with(client, 502, "Bad Gateway", e).await),
            }
        }
        Some(up) => {
            let tunnel = upstream::connect_http_tunnel(
                up,
                target,
                connection_id,
                limits.connect_timeout,
            )
            .await;
            let tunnel = match tunnel {
                Ok(tunnel) => tunnel,
                Err(e) => return Err(fail_with(client, 502, "Bad Gateway", e).await),
            };
            let HttpTunnel {
                stream,
                response,
                head,
                channel,
            } = tunnel;

            if response.status != 200 {
                let (status, reason) = http::upstream_failure_status(response.status);
                let err = ForwarderError::upstream(format!(
                    "Upstream proxy responded to CONNECT {} with {} {}",
                    target, response.status, response.reason
                ));
                return Err(fail_with(client, status, reason, err).await);
            }

            shared.emit_tunnel_connect_responded(&TunnelConnectResponded {
                response: &response,
                channel: &channel,
                head: &head,
            });
            (stream, head)
        }
    };

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    if !head.is_empty() {
        client.write_all(&head).await?;
    }
    if !leftover.is_empty() {
        remote.write_all(&leftover).await?;
    }
    client.flush().await?;

    let (sent, received) = relay::relay(client, remote, limits.idle_timeout).await;
    debug!(
        "Connection #{}: Tunnel to {} finished (sent {} bytes, received {} bytes)",
        connection_id, target, sent, received
    );
    Ok(())
}

/// 为普通 HTTP 请求建立出站连接，并生成要发送的请求头
async fn connect_forward_target(
    request: &RequestHead,
    host: &str,
    port: u16,
    upstream: Option<&Upstream>,
    limits: ForwarderLimits,
) -> Result<(BoxedStream, Vec<u8>), ForwarderError> {
    match upstream {
        None => {
            let addr = if host.contains(':') {
                format!("[{}]:{}", host, port)
            } else {
                format!("{}:{}", host, port)
            };
            let stream = upstream::connect_tcp(&addr, limits.connect_timeout).await?;
            let outgoing = http::build_forward_request(request, RequestForm::Origin, None)?;
            Ok((Box::new(stream), outgoing))
        }
        Some(up) if up.scheme.is_socks() => {
            let stream = upstream::connect_socks(up, host, port, limits.connect_timeout).await?;
            let outgoing = http::build_forward_request(request, RequestForm::Origin, None)?;
            Ok((Box::new(stream), outgoing))
        }
        Some(up) => {
            let (stream, _) = upstream::connect_http_proxy(up, 0, limits.connect_timeout).await?;
            let auth = up.proxy_authorization();
            let outgoing =
                http::build_forward_request(request, RequestForm::Absolute, auth.as_deref())?;
            Ok((stream, outgoing))
        }
    }
}

/// 普通 HTTP 请求转发（GET http://... 等）
async fn handle_forward(
    client: &mut TcpStream,
    request: &RequestHead,
    leftover: Vec<u8>,
    upstream: Option<&Upstream>,
    limits: ForwarderLimits,
) -> Result<(), ForwarderError> {
    let (_, host, port) = match http::parse_absolute_target(&request.target) {
        Ok(parts) => parts,
        Err(e) => return Err(fail_with(client, 400, "Bad Request", e).await),
    };

    let connected = connect_forward_target(request, &host, port, upstream, limits).await;

    let (mut remote, outgoing) = match connected {
        Ok(parts) => parts,
        Err(e) => return Err(fail_with(client, 502, "Bad Gateway", e).await),
    };

    remote.write_all(&outgoing).await?;
    if !leftover.is_empty() {
        remote.write_all(&leftover).await?;
    }
    remote.flush().await?;

    relay::relay(client, remote, limits.idle_timeout).await;
    Ok(())
}
