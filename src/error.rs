/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，调用方可以区分输入校验失败
/// 和转发服务器（协作组件）自身的失败
use std::io;
use thiserror::Error;

/// 匿名化核心的错误类型
#[derive(Error, Debug)]
pub enum AnonymizerError {
    /// 参数形状错误（编程错误，而非运行时状态）
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 本地监听端口超出 [0, 65535]
    #[error("Invalid local port: must be a number between 0 and 65535 (was {0})")]
    InvalidPort(i64),

    /// 代理 URL 无法解析
    #[error("Invalid proxy URL: {reason} (was \"{url}\")")]
    InvalidProxyUrl { url: String, reason: String },

    /// 协议不在允许列表中
    #[error("Invalid proxy URL: must have one of the following protocols: {accepted} (was \"{scheme}\")")]
    UnsupportedScheme { scheme: String, accepted: String },

    /// 转发服务器启动失败（原样透传）
    #[error(transparent)]
    ServerStart(ForwarderError),

    /// 转发服务器关闭失败（原样透传）
    #[error(transparent)]
    ServerShutdown(ForwarderError),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, AnonymizerError>;

impl AnonymizerError {
    /// 创建参数错误
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// 创建 URL 解析错误
    pub fn invalid_proxy_url(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidProxyUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// 检查是否为同步的输入校验错误
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_)
                | Self::InvalidPort(_)
                | Self::InvalidProxyUrl { .. }
                | Self::UnsupportedScheme { .. }
        )
    }

    /// 检查是否为端口错误
    pub fn is_invalid_port(&self) -> bool {
        matches!(self, Self::InvalidPort(_))
    }

    /// 检查是否为协议错误
    pub fn is_unsupported_scheme(&self) -> bool {
        matches!(self, Self::UnsupportedScheme { .. })
    }
}

/// 转发服务器的错误类型
#[derive(Error, Debug)]
pub enum ForwarderError {
    /// 监听失败（例如端口被占用）
    #[error("Failed to bind forwarder to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 关闭过程失败
    #[error("Forwarder shutdown failed: {0}")]
    Shutdown(String),

    /// 上游代理错误
    #[error("Upstream proxy error: {0}")]
    Upstream(String),

    /// 协议错误
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 超时
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ForwarderError {
    /// 创建监听失败错误
    pub fn bind(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }

    /// 创建上游错误
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为端口占用
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, Self::Bind { source, .. } if source.kind() == io::ErrorKind::AddrInUse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_invalid_port_message() {
        let err = AnonymizerError::InvalidPort(65536);
        assert!(err.is_invalid_port());
        assert!(err.is_validation());
        assert_eq!(
            err.to_string(),
            "Invalid local port: must be a number between 0 and 65535 (was 65536)"
        );
    }

    #[test]
    fn test_unsupported_scheme_lists_accepted() {
        let err = AnonymizerError::UnsupportedScheme {
            scheme: "ftp".to_string(),
            accepted: "\"http\", \"https\"".to_string(),
        };
        assert!(err.is_unsupported_scheme());
        assert!(err.to_string().contains("\"http\", \"https\""));
        assert!(err.to_string().contains("ftp"));
        assert!(err.to_string().starts_with("Invalid proxy URL:"));
    }

    #[test]
    fn test_server_start_is_transparent() {
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "address in use");
        let inner = ForwarderError::bind("127.0.0.1:8000", io_err);
        let inner_msg = inner.to_string();
        let err = AnonymizerError::ServerStart(inner);

        assert_eq!(err.to_string(), inner_msg);
        assert!(!err.is_validation());
        assert!(err.source().is_some());
    }

    #[test]
    fn test_addr_in_use_check() {
        let in_use = ForwarderError::bind(
            "127.0.0.1:1",
            io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        );
        let denied = ForwarderError::bind(
            "127.0.0.1:1",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(in_use.is_addr_in_use());
        assert!(!denied.is_addr_in_use());
    }
}
