/// HTTP/1.x 报文头解析与重写
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;

use super::ConnectResponse;
use crate::error::ForwarderError;

/// HTTP 报文头最大长度
pub const MAX_HEAD_SIZE: usize = 16384;

/// 读取缓冲区大小
const READ_CHUNK_SIZE: usize = 4096;

/// 逐跳头部，转发时不透传
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "proxy-connection",
    "proxy-authorization",
    "connection",
    "keep-alive",
];

/// 入站请求的起始行和头部
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    /// 保留原始大小写的头部
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// 按名称查找头部（大小写不敏感）
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// 转发请求时使用的请求目标形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestForm {
    /// `GET http://host/path`，发给上游 HTTP 代理
    Absolute,
    /// `GET /path`，直接发给目标服务器
    Origin,
}

/// 读取到第一个 `\r\n\r\n` 为止
///
/// 返回 (报文头, 报文头之后已读取的字节)。
pub async fn read_head<R>(reader: &mut R, limit: usize) -> Result<(Vec<u8>, Vec<u8>), ForwarderError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(ForwarderError::protocol(
                "Unexpected EOF while reading HTTP head",
            ));
        }

        // 从上一次结尾前 3 个字节开始查找，避免分隔符跨越两次读取
        let search_from = buffer.len().saturating_sub(3);
        buffer.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buffer[search_from..]
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
        {
            let end = search_from + pos + 4;
            let leftover = buffer.split_off(end);
            return Ok((buffer, leftover));
        }

        if buffer.len() >= limit {
            return Err(ForwarderError::protocol(format!(
                "HTTP head exceeds {} bytes",
                limit
            )));
        }
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<(String, String)> {
    lines
        .filter_map(|line| {
            let colon = line.find(':')?;
            Some((
                line[..colon].trim().to_string(),
                line[colon + 1..].trim().to_string(),
            ))
        })
        .collect()
}

/// 解析请求头
pub fn parse_request(head: &[u8]) -> Result<RequestHead, ForwarderError> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");

    let first_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ForwarderError::protocol("Empty HTTP request"))?;

    let mut parts = first_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => {
            return Err(ForwarderError::protocol(format!(
                "Invalid HTTP request line: {}",
                first_line
            )))
        }
    };

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers: parse_headers(lines.filter(|l| !l.is_empty())),
    })
}

/// 解析上游对 CONNECT 的响应头
pub fn parse_response(head: &[u8]) -> Result<ConnectResponse, ForwarderError> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| ForwarderError::upstream("Empty response from upstream proxy"))?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ForwarderError::upstream(format!(
            "Invalid status line from upstream proxy: {}",
            status_line
        )));
    }

    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            ForwarderError::upstream(format!(
                "Invalid status code from upstream proxy: {}",
                status_line
            ))
        })?;

    Ok(ConnectResponse {
        status,
        reason: parts.next().unwrap_or_default().trim().to_string(),
        headers: parse_headers(lines.filter(|l| !l.is_empty())),
    })
}

/// 构造 `Basic` 认证头的值
pub fn basic_auth(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
}

/// 解析 `Proxy-Authorization: Basic ...`
pub fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':').unwrap_or((decoded.as_str(), ""));
    Some((username.to_string(), password.to_string()))
}

/// 解析绝对形式的请求目标，返回 (url, host, port)
pub fn parse_absolute_target(target: &str) -> Result<(Url, String, u16), ForwarderError> {
    let url = Url::parse(target)
        .map_err(|e| ForwarderError::protocol(format!("Invalid request target '{}': {}", target, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| ForwarderError::protocol(format!("No host in request target '{}'", target)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ForwarderError::protocol(format!("No port in request target '{}'", target)))?;
    Ok((url, host, port))
}

/// 拆分 `host:port`（支持 `[ipv6]:port`）
pub fn split_host_port(target: &str) -> Result<(String, u16), ForwarderError> {
    let invalid = || ForwarderError::protocol(format!("Invalid target address: {}", target));

    let (host, port) = target.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

/// 重建转发请求：去掉逐跳头部，可选地加上上游认证
pub fn build_forward_request(
    head: &RequestHead,
    form: RequestForm,
    proxy_authorization: Option<&str>,
) -> Result<Vec<u8>, ForwarderError> {
    let (url, host, port) = parse_absolute_target(&head.target)?;

    let target = match form {
        RequestForm::Absolute => head.target.clone(),
        RequestForm::Origin => {
            let mut path = url.path().to_string();
            if let Some(query) = url.query() {
                path.push('?');
                path.push_str(query);
            }
            path
        }
    };

    let mut request = format!("{} {} {}\r\n", head.method, target, head.version);

    if head.header("host").is_none() {
        // IPv6 字面量需要方括号
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host
        };
        match url.port() {
            Some(_) => request.push_str(&format!("Host: {}:{}\r\n", host, port)),
            None => request.push_str(&format!("Host: {}\r\n", host)),
        }
    }

    for (key, value) in &head.headers {
        let lower = key.to_ascii_lowercase();
        if !HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
            request.push_str(&format!("{}: {}\r\n", key, value));
        }
    }

    if let Some(auth) = proxy_authorization {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("Connection: close\r\n\r\n");

    Ok(request.into_bytes())
}

/// 构造 CONNECT 请求
pub fn build_connect_request(target: &str, proxy_authorization: Option<&str>) -> Vec<u8> {
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if let Some(auth) = proxy_authorization {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");
    request.into_bytes()
}

/// 构造简单的错误响应
pub fn error_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        reason,
        body.len(),
        body
    )
    .into_bytes()
}

/// 要求入站客户端认证的 407 响应
pub fn auth_required_response(realm: &str) -> Vec<u8> {
    let body = "Proxy credentials required.";
    format!(
        "HTTP/1.1 407 Proxy Authentication Required\r\n\
         Proxy-Authenticate: Basic realm=\"{}\"\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        realm,
        body.len(),
        body
    )
    .into_bytes()
}

/// 上游 CONNECT 失败时返回给客户端的状态
pub fn upstream_failure_status(upstream_status: u16) -> (u16, &'static str) {
    match upstream_status {
        407 => (597, "Upstream Proxy Authentication Required"),
        _ => (502, "Bad Gateway"),
    }
}
