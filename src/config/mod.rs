// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

// 重新导出 builder 和 validator
pub use builder::{GatewayConfigBuilder, ServerConfigBuilder};
pub use validator::ConfigValidator;

use crate::transport::TransportType;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_alpn() -> Vec<String> {
    vec!["http/1.1".to_string()]
}

fn default_usage_flush_secs() -> u64 {
    300
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_udp_idle_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// 服务器端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 服务器监听地址
    pub bind_addr: String,
    /// 服务器监听端口
    pub bind_port: u16,
    /// 传输类型（tls, wss）
    #[serde(default)]
    pub transport: TransportType,
    /// WebSocket 路径（仅 wss）
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// 是否运行在终止 TLS 的反向代理后（此时监听明文 TCP）
    #[serde(default)]
    pub behind_proxy: bool,
    /// TLS 证书路径
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// TLS 私钥路径
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// TLS ALPN 协议列表
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,
    /// 握手失败时回落的地址（host:port），未配置时直接关闭连接
    #[serde(default)]
    pub fallback_addr: Option<String>,
    /// 是否启用流量整形
    #[serde(default)]
    pub reshape: bool,
    /// 用量文件路径（可选）
    #[serde(default)]
    pub usage_file: Option<PathBuf>,
    /// 用量刷新间隔（秒）
    #[serde(default = "default_usage_flush_secs")]
    pub usage_flush_secs: u64,
    /// 握手超时（秒）
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// UDP 会话空闲超时（秒）
    #[serde(default = "default_udp_idle_timeout_secs")]
    pub udp_idle_timeout_secs: u64,
    /// 连接目标超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 速率限制配置（可选）
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

/// 速率限制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 每秒允许的新连接数
    pub requests_per_second: u32,
    /// 突发容量（允许短时间内的峰值连接数）
    pub burst_size: u32,
    /// 单个来源 IP 每秒允许的新连接数（可选）
    #[serde(default)]
    pub per_peer_per_second: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 100,
            burst_size: 200,
            per_peer_per_second: None,
        }
    }
}

impl ServerConfig {
    /// 创建 Builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_server_config(self)
    }

    /// 监听地址（host:port）
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn usage_flush_interval(&self) -> Duration {
        Duration::from_secs(self.usage_flush_secs)
    }
}

/// 用户配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    /// 配额（GiB），0 表示不限
    #[serde(default)]
    pub quota: u64,
    #[serde(default)]
    pub admin: bool,
}

/// 访问控制规则配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// tcp 或 udp，未设置时同时匹配
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// 主机子串，或特殊值 `private`
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub cidr: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    pub allow: bool,
}

/// 完整网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl GatewayConfig {
    /// 创建 Builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::new()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_gateway_config(self)
    }

    /// 从 TOML 字符串解析并验证
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: GatewayConfig =
            toml::from_str(content).context("Failed to parse gateway configuration")?;
        config
            .validate()
            .context("Gateway configuration validation failed")?;
        Ok(config)
    }

    /// 从文件加载配置
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }
}
