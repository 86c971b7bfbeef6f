/// 代理描述符解析与校验
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use url::Url;

use crate::error::{AnonymizerError, Result};
use crate::forwarder::SOCKS_SCHEMES;
use crate::uri::{decode_uri_component_safe, redact_url};

/// 可接受的代理协议集合
///
/// SOCKS 协议列表由转发服务器声明，这里作为注入值持有而不是写死。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemeSet {
    schemes: Vec<String>,
}

impl SchemeSet {
    /// 使用给定协议列表创建（保持顺序，去重）
    pub fn new<I, S>(schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = BTreeSet::new();
        let schemes = schemes
            .into_iter()
            .map(|s| s.into().to_ascii_lowercase())
            .filter(|s| seen.insert(s.clone()))
            .collect();
        Self { schemes }
    }

    /// http、https 加上转发服务器支持的 SOCKS 协议
    pub fn with_socks(socks_schemes: &[&str]) -> Self {
        Self::new(["http", "https"].iter().chain(socks_schemes.iter()).copied())
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.schemes.iter().map(String::as_str)
    }

    /// 用于错误信息的列表：`"http", "https", ...`
    pub fn describe(&self) -> String {
        self.schemes
            .iter()
            .map(|s| format!("\"{}\"", s))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Default for SchemeSet {
    fn default() -> Self {
        Self::with_socks(SOCKS_SCHEMES)
    }
}

/// 结构化的匿名化选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymizeOptions {
    /// 上游代理 URL
    pub url: String,
    /// 本地监听端口，0 表示由系统分配
    #[serde(default)]
    pub port: i64,
    /// 是否忽略上游 HTTPS 代理的证书错误
    #[serde(default)]
    pub ignore_proxy_certificate: bool,
}

impl AnonymizeOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            port: 0,
            ignore_proxy_certificate: false,
        }
    }

    pub fn port(mut self, port: i64) -> Self {
        self.port = port;
        self
    }

    pub fn ignore_proxy_certificate(mut self, ignore: bool) -> Self {
        self.ignore_proxy_certificate = ignore;
        self
    }
}

/// `open` 的输入：裸 URL 或结构化选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyInput {
    Url(String),
    Options(AnonymizeOptions),
}

impl From<&str> for ProxyInput {
    fn from(url: &str) -> Self {
        ProxyInput::Url(url.to_string())
    }
}

impl From<String> for ProxyInput {
    fn from(url: String) -> Self {
        ProxyInput::Url(url)
    }
}

impl From<&String> for ProxyInput {
    fn from(url: &String) -> Self {
        ProxyInput::Url(url.clone())
    }
}

impl From<AnonymizeOptions> for ProxyInput {
    fn from(options: AnonymizeOptions) -> Self {
        ProxyInput::Options(options)
    }
}

/// 上游代理凭据（已解码）
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// 规范化的代理描述符，构造后不可变
#[derive(Clone)]
pub struct ProxyDescriptor {
    original: String,
    url: Url,
    host: String,
    port: u16,
    credentials: Option<Credentials>,
    local_port: u16,
    ignore_proxy_certificate: bool,
}

impl ProxyDescriptor {
    /// 调用方提供的原始 URL 字符串
    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn ignore_proxy_certificate(&self) -> bool {
        self.ignore_proxy_certificate
    }
}

impl fmt::Debug for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyDescriptor")
            .field("url", &redact_url(&self.url))
            .field("credentials", &self.credentials)
            .field("local_port", &self.local_port)
            .field("ignore_proxy_certificate", &self.ignore_proxy_certificate)
            .finish_non_exhaustive()
    }
}

/// 代理协议的默认端口
pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        s if s.starts_with("socks") => Some(1080),
        _ => None,
    }
}

/// 校验输入并构造描述符
///
/// 顺序：端口范围 → URL 解析 → 协议白名单 → 主机。
pub fn validate(input: &ProxyInput, schemes: &SchemeSet) -> Result<ProxyDescriptor> {
    let (raw_url, port, ignore_proxy_certificate) = match input {
        ProxyInput::Url(url) => (url.as_str(), 0i64, false),
        ProxyInput::Options(options) => (
            options.url.as_str(),
            options.port,
            options.ignore_proxy_certificate,
        ),
    };

    let local_port = u16::try_from(port).map_err(|_| AnonymizerError::InvalidPort(port))?;

    let url = Url::parse(raw_url).map_err(|e| AnonymizerError::invalid_proxy_url(raw_url, e))?;

    if !schemes.contains(url.scheme()) {
        return Err(AnonymizerError::UnsupportedScheme {
            scheme: url.scheme().to_string(),
            accepted: schemes.describe(),
        });
    }

    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host.trim_start_matches('[').trim_end_matches(']'),
        _ => {
            return Err(AnonymizerError::invalid_proxy_url(
                raw_url,
                "URL must contain a host",
            ))
        }
    }
    .to_string();

    let port = url
        .port()
        .or_else(|| default_port(url.scheme()))
        .ok_or_else(|| AnonymizerError::invalid_proxy_url(raw_url, "URL must contain a port"))?;

    let username = url.username();
    let password = url.password().unwrap_or("");
    let credentials = if username.is_empty() && password.is_empty() {
        None
    } else {
        Some(Credentials {
            username: decode_uri_component_safe(username),
            password: decode_uri_component_safe(password),
        })
    };

    Ok(ProxyDescriptor {
        original: raw_url.to_string(),
        host,
        port,
        credentials,
        local_port,
        ignore_proxy_certificate,
        url,
    })
}
