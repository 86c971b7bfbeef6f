/// proxy-anonymizer 库入口
///
/// 把需要认证（或需要忽略证书）的上游代理包装成本地免认证的 HTTP 代理
pub mod anonymizer;
pub mod callback;
pub mod cli;
pub mod config;
pub mod decision;
pub mod descriptor;
pub mod error;
pub mod forwarder;
pub mod registry;
pub mod tls;
pub mod uri;

// 重新导出常用类型
pub use anonymizer::{
    anonymize_proxy, close_anonymized_proxy, listen_connect_anonymized_proxy, Anonymizer,
};
pub use config::{AppConfig, ForwarderLimits, ProxyEntry};
pub use decision::needs_anonymization;
pub use descriptor::{validate, AnonymizeOptions, ProxyDescriptor, ProxyInput, SchemeSet};
pub use error::{AnonymizerError, ForwarderError, Result};
pub use forwarder::{
    ConnectResponse, ForwarderConfig, ForwardingServer, PrepareDecision, RequestInfo,
    ServerFactory, TcpServerFactory, TunnelChannel, TunnelConnectResponded, TunnelObserver,
    UpstreamForwarder, SOCKS_SCHEMES,
};
pub use registry::ProxyRegistry;
pub use uri::{decode_uri_component_safe, redact_url};
