/// 匿名代理的生命周期管理
///
/// 校验上游代理描述符，需要时启动本地转发服务器并登记，
/// 之后可以按本地 URL 关闭服务器或订阅隧道事件。
use std::io;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use crate::callback::settle;
use crate::config::ForwarderLimits;
use crate::decision::needs_anonymization;
use crate::descriptor::{validate, ProxyInput, SchemeSet};
use crate::error::{AnonymizerError, ForwarderError, Result};
use crate::forwarder::{ForwarderConfig, ServerFactory, TcpServerFactory, TunnelObserver};
use crate::registry::ProxyRegistry;
use crate::uri::redact_url;

/// 本地代理监听地址
pub const LOCAL_HOST: &str = "127.0.0.1";

static GLOBAL: OnceLock<Anonymizer> = OnceLock::new();

/// 匿名代理管理器
pub struct Anonymizer {
    registry: ProxyRegistry,
    factory: Arc<dyn ServerFactory>,
    schemes: SchemeSet,
    limits: ForwarderLimits,
}

impl Default for Anonymizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Anonymizer {
    /// 使用默认 TCP 转发服务器和环境变量中的运行参数
    pub fn new() -> Self {
        Self::with_factory(Arc::new(TcpServerFactory))
    }

    pub fn with_factory(factory: Arc<dyn ServerFactory>) -> Self {
        Self {
            registry: ProxyRegistry::new(),
            factory,
            schemes: SchemeSet::default(),
            limits: ForwarderLimits::from_env(),
        }
    }

    /// 替换接受的协议集合
    pub fn with_schemes(mut self, schemes: SchemeSet) -> Self {
        self.schemes = schemes;
        self
    }

    pub fn with_limits(mut self, limits: ForwarderLimits) -> Self {
        self.limits = limits;
        self
    }

    /// 进程级实例，首次访问时创建
    pub fn global() -> &'static Anonymizer {
        GLOBAL.get_or_init(Anonymizer::new)
    }

    pub fn registry(&self) -> &ProxyRegistry {
        &self.registry
    }

    pub fn schemes(&self) -> &SchemeSet {
        &self.schemes
    }

    /// 返回一个不需要认证的代理 URL
    ///
    /// 上游不需要凭据也不需要忽略证书时直接返回原 URL，不创建任何东西；
    /// 否则启动本地转发服务器并返回 `http://127.0.0.1:<port>`。
    pub async fn open(&self, input: impl Into<ProxyInput>) -> Result<String> {
        let input = input.into();
        let descriptor = validate(&input, &self.schemes)?;

        if !needs_anonymization(&descriptor) {
            debug!(
                "Anonymizer: {} needs no anonymization",
                redact_url(descriptor.url())
            );
            return Ok(descriptor.original().to_string());
        }

        let config = ForwarderConfig::anonymous(
            descriptor.local_port(),
            descriptor.url().clone(),
            descriptor.ignore_proxy_certificate(),
        )
        .with_limits(self.limits);

        let server = self
            .factory
            .start(config)
            .await
            .map_err(AnonymizerError::ServerStart)?;

        let key = format!("http://{}:{}", LOCAL_HOST, server.port());
        if !self.registry.insert(key.clone(), server.clone()) {
            warn!("Anonymizer: {} is already registered", key);
            if let Err(e) = server.close(true).await {
                warn!("Anonymizer: failed to close duplicate server {}: {}", key, e);
            }
            return Err(AnonymizerError::ServerStart(ForwarderError::bind(
                key,
                io::Error::from(io::ErrorKind::AddrInUse),
            )));
        }

        info!("Anonymizer: {} -> {}", key, redact_url(descriptor.url()));
        Ok(key)
    }

    /// 同 [`open`](Self::open)，结果同时交给回调
    pub async fn open_with_callback<F>(
        &self,
        input: impl Into<ProxyInput>,
        callback: F,
    ) -> Result<String>
    where
        F: FnOnce(std::result::Result<&String, &AnonymizerError>),
    {
        let result = self.open(input).await;
        settle(result, callback)
    }

    /// 关闭由 [`open`](Self::open) 创建的本地代理
    ///
    /// 未登记的 URL 返回 `false`。先从注册表移除再等待关闭，
    /// 因此并发关闭同一个 URL 时只有一个返回 `true`。
    pub async fn close(&self, local_url: &str, force_disconnect: bool) -> Result<bool> {
        if local_url.trim().is_empty() {
            return Err(AnonymizerError::invalid_argument(
                "local proxy URL must be a non-empty string",
            ));
        }

        let Some(server) = self.registry.remove(local_url) else {
            debug!("Anonymizer: {} is not registered", local_url);
            return Ok(false);
        };

        server
            .close(force_disconnect)
            .await
            .map_err(AnonymizerError::ServerShutdown)?;

        info!("Anonymizer: {} closed (force={})", local_url, force_disconnect);
        Ok(true)
    }

    pub async fn close_with_callback<F>(
        &self,
        local_url: &str,
        force_disconnect: bool,
        callback: F,
    ) -> Result<bool>
    where
        F: FnOnce(std::result::Result<&bool, &AnonymizerError>),
    {
        let result = self.close(local_url, force_disconnect).await;
        settle(result, callback)
    }

    /// 关闭所有已登记的本地代理，返回第一个失败
    pub async fn close_all(&self, force_disconnect: bool) -> Result<usize> {
        let mut closed = 0;
        let mut first_error = None;
        for url in self.registry.urls() {
            match self.close(&url, force_disconnect).await {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Anonymizer: failed to close {}: {}", url, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }

    /// 订阅上游 CONNECT 响应事件
    ///
    /// 未登记的 URL 返回 `false`，观察者不会被保存。
    pub fn subscribe_tunnel_event(&self, local_url: &str, observer: TunnelObserver) -> bool {
        match self.registry.get(local_url) {
            Some(server) => {
                server.on_tunnel_connect_responded(observer);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Anonymizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Anonymizer")
            .field("registry", &self.registry)
            .field("schemes", &self.schemes)
            .field("limits", &self.limits)
            .finish()
    }
}

/// 通过进程级实例匿名化代理
pub async fn anonymize_proxy(input: impl Into<ProxyInput>) -> Result<String> {
    Anonymizer::global().open(input).await
}

/// 通过进程级实例关闭匿名代理
pub async fn close_anonymized_proxy(local_url: &str, force_disconnect: bool) -> Result<bool> {
    Anonymizer::global().close(local_url, force_disconnect).await
}

/// 通过进程级实例订阅隧道事件
pub fn listen_connect_anonymized_proxy(local_url: &str, observer: TunnelObserver) -> bool {
    Anonymizer::global().subscribe_tunnel_event(local_url, observer)
}
