/// 自定义错误类型
///
/// 握手阶段的错误（格式、认证、配额、协议、策略）都会触发回落（fallback），
/// 其余错误只终止当前连接
use std::io;
use thiserror::Error;

/// TLS Gate 的主要错误类型
#[derive(Error, Debug)]
pub enum GatewayError {
    /// 请求行格式错误
    #[error("Format error: {0}")]
    Format(String),

    /// 未知凭证
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// 凭证有效但配额已用完
    #[error("User '{username}' has exhausted its quota")]
    QuotaExceeded { username: String },

    /// 地址编码被截断或无效
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 访问控制规则拒绝
    #[error("Policy denied: [{username}] {target} is not allowed")]
    PolicyDenied { username: String, target: String },

    /// 目标不可达
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 传输层错误
    #[error("Transport error: {0}")]
    Transport(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn quota_exceeded(username: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            username: username.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn policy_denied(username: impl Into<String>, target: impl Into<String>) -> Self {
        Self::PolicyDenied {
            username: username.into(),
            target: target.into(),
        }
    }

    /// 创建连接失败错误
    pub fn connect(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Connect {
            addr: addr.into(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 是否属于握手阶段的错误（需要回落到 fallback）
    pub fn is_handshake_error(&self) -> bool {
        matches!(
            self,
            Self::Format(_)
                | Self::Auth(_)
                | Self::QuotaExceeded { .. }
                | Self::Protocol(_)
                | Self::PolicyDenied { .. }
                | Self::Timeout { .. }
                | Self::Io(_)
        )
    }

    pub fn is_auth_failed(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    pub fn is_policy_denied(&self) -> bool {
        matches!(self, Self::PolicyDenied { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
