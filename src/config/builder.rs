use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::transport::TransportType;

use super::{
    default_alpn, default_connect_timeout_secs, default_handshake_timeout_secs,
    default_udp_idle_timeout_secs, default_usage_flush_secs, default_ws_path,
    validator::ConfigValidator, GatewayConfig, RateLimitConfig, RuleConfig, ServerConfig,
    UserConfig,
};

/// ServerConfig Builder
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    bind_addr: Option<String>,
    bind_port: Option<u16>,
    transport: Option<TransportType>,
    ws_path: Option<String>,
    behind_proxy: bool,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    alpn: Option<Vec<String>>,
    fallback_addr: Option<String>,
    reshape: bool,
    usage_file: Option<PathBuf>,
    usage_flush_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    udp_idle_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    rate_limit: Option<RateLimitConfig>,
}

impl ServerConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置绑定地址
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = Some(addr.into());
        self
    }

    /// 设置绑定端口
    pub fn bind_port(mut self, port: u16) -> Self {
        self.bind_port = Some(port);
        self
    }

    /// 设置传输类型
    pub fn transport(mut self, transport: TransportType) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 设置 WebSocket 路径
    pub fn ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = Some(path.into());
        self
    }

    /// 设置是否在反向代理后运行
    pub fn behind_proxy(mut self, behind: bool) -> Self {
        self.behind_proxy = behind;
        self
    }

    /// 设置证书路径
    pub fn cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(path.into());
        self
    }

    /// 设置私钥路径
    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    /// 设置 ALPN 协议列表
    pub fn alpn(mut self, protocols: Vec<String>) -> Self {
        self.alpn = Some(protocols);
        self
    }

    /// 设置回落地址
    pub fn fallback_addr(mut self, addr: impl Into<String>) -> Self {
        self.fallback_addr = Some(addr.into());
        self
    }

    /// 设置是否启用流量整形
    pub fn reshape(mut self, enabled: bool) -> Self {
        self.reshape = enabled;
        self
    }

    /// 设置用量文件
    pub fn usage_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.usage_file = Some(path.into());
        self
    }

    pub fn usage_flush_secs(mut self, secs: u64) -> Self {
        self.usage_flush_secs = Some(secs);
        self
    }

    pub fn handshake_timeout_secs(mut self, secs: u64) -> Self {
        self.handshake_timeout_secs = Some(secs);
        self
    }

    pub fn udp_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.udp_idle_timeout_secs = Some(secs);
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = Some(secs);
        self
    }

    /// 设置速率限制
    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// 构建 ServerConfig 并验证
    pub fn build(self) -> Result<ServerConfig> {
        let config = ServerConfig {
            bind_addr: self.bind_addr.context("bind_addr is required")?,
            bind_port: self.bind_port.context("bind_port is required")?,
            transport: self.transport.unwrap_or_default(),
            ws_path: self.ws_path.unwrap_or_else(default_ws_path),
            behind_proxy: self.behind_proxy,
            cert_path: self.cert_path,
            key_path: self.key_path,
            alpn: self.alpn.unwrap_or_else(default_alpn),
            fallback_addr: self.fallback_addr,
            reshape: self.reshape,
            usage_file: self.usage_file,
            usage_flush_secs: self.usage_flush_secs.unwrap_or_else(default_usage_flush_secs),
            handshake_timeout_secs: self
                .handshake_timeout_secs
                .unwrap_or_else(default_handshake_timeout_secs),
            udp_idle_timeout_secs: self
                .udp_idle_timeout_secs
                .unwrap_or_else(default_udp_idle_timeout_secs),
            connect_timeout_secs: self
                .connect_timeout_secs
                .unwrap_or_else(default_connect_timeout_secs),
            rate_limit: self.rate_limit,
        };

        // 验证配置
        ConfigValidator::validate_server_config(&config)?;

        Ok(config)
    }
}

/// GatewayConfig Builder
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    server: Option<ServerConfig>,
    users: Vec<UserConfig>,
    rules: Vec<RuleConfig>,
}

impl GatewayConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置服务器配置
    pub fn server(mut self, server: ServerConfig) -> Self {
        self.server = Some(server);
        self
    }

    /// 添加用户
    pub fn add_user(mut self, username: impl Into<String>, password: impl Into<String>, quota: u64) -> Self {
        self.users.push(UserConfig {
            username: username.into(),
            password: password.into(),
            quota,
            admin: false,
        });
        self
    }

    /// 批量设置用户
    pub fn users(mut self, users: Vec<UserConfig>) -> Self {
        self.users = users;
        self
    }

    /// 添加规则
    pub fn add_rule(mut self, rule: RuleConfig) -> Self {
        self.rules.push(rule);
        self
    }

    /// 批量设置规则
    pub fn rules(mut self, rules: Vec<RuleConfig>) -> Self {
        self.rules = rules;
        self
    }

    /// 构建 GatewayConfig 并验证
    pub fn build(self) -> Result<GatewayConfig> {
        let config = GatewayConfig {
            server: self.server.context("server config is required")?,
            users: self.users,
            rules: self.rules,
        };

        // 验证配置
        ConfigValidator::validate_gateway_config(&config)?;

        Ok(config)
    }
}
