use anyhow::{bail, Result};
use std::collections::HashSet;
use tracing::warn;

use super::{GatewayConfig, RateLimitConfig, RuleConfig, ServerConfig, UserConfig};
use crate::registry::credential_for;
use crate::rules::Rule;
use crate::transport::TransportType;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证名称不为空
    pub fn validate_name(name: &str, context: &str) -> Result<()> {
        if name.trim().is_empty() {
            bail!("{}: name cannot be empty", context);
        }
        Ok(())
    }

    /// 验证 host:port 形式的地址
    pub fn validate_host_port(addr: &str, context: &str) -> Result<()> {
        Self::validate_address(addr, context)?;
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
                Ok(port) => Self::validate_port(port, context),
                Err(_) => bail!("{}: invalid port in '{}'", context, addr),
            },
            _ => bail!("{}: '{}' must be in host:port form", context, addr),
        }
    }

    /// 验证超时时间
    pub fn validate_timeout(secs: u64, name: &str) -> Result<()> {
        if secs == 0 {
            bail!("{} must be greater than 0", name);
        }
        Ok(())
    }

    /// 验证服务器配置
    pub fn validate_server_config(config: &ServerConfig) -> Result<()> {
        // 验证绑定地址
        Self::validate_address(&config.bind_addr, "Server bind_addr")?;
        Self::validate_port(config.bind_port, "Server bind_port")?;

        // 验证证书配置
        match (&config.cert_path, &config.key_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => bail!("cert_path and key_path must both be set, or both omitted to auto-generate"),
        }

        // 当在反向代理后运行时，不需要证书
        if config.behind_proxy && (config.cert_path.is_some() || config.key_path.is_some()) {
            bail!("Certificates are not needed when running behind a proxy (TLS is terminated by the proxy).");
        }

        if config.transport == TransportType::Wss && !config.ws_path.starts_with('/') {
            bail!("ws_path must start with '/' (current: '{}')", config.ws_path);
        }

        if let Some(ref fallback) = config.fallback_addr {
            Self::validate_host_port(fallback, "Server fallback_addr")?;
        } else {
            warn!("No fallback_addr configured, failed handshakes will simply be closed");
        }

        Self::validate_timeout(config.handshake_timeout_secs, "handshake_timeout_secs")?;
        Self::validate_timeout(config.udp_idle_timeout_secs, "udp_idle_timeout_secs")?;
        Self::validate_timeout(config.connect_timeout_secs, "connect_timeout_secs")?;
        if config.usage_file.is_some() {
            Self::validate_timeout(config.usage_flush_secs, "usage_flush_secs")?;
        }

        // 验证速率限制配置
        if let Some(ref rate_limit) = config.rate_limit {
            Self::validate_rate_limit_config(rate_limit)?;
        }

        Ok(())
    }

    /// 验证速率限制配置
    pub fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<()> {
        if config.requests_per_second == 0 {
            bail!("rate_limit.requests_per_second must be greater than 0");
        }
        if config.burst_size == 0 {
            bail!("rate_limit.burst_size must be greater than 0");
        }
        if config.per_peer_per_second == Some(0) {
            bail!("rate_limit.per_peer_per_second must be greater than 0");
        }
        if config.burst_size < config.requests_per_second {
            warn!(
                "rate_limit.burst_size ({}) is less than requests_per_second ({}), \
                 this may cause frequent rate limiting",
                config.burst_size, config.requests_per_second
            );
        }
        Ok(())
    }

    /// 验证用户列表
    pub fn validate_users(users: &[UserConfig]) -> Result<()> {
        if users.is_empty() {
            bail!("No users defined");
        }

        let mut seen_names = HashSet::new();
        let mut seen_credentials = HashSet::new();

        for user in users {
            Self::validate_name(&user.username, "User name")?;

            if user.password.is_empty() {
                bail!("User '{}': password cannot be empty", user.username);
            }

            if !seen_names.insert(&user.username) {
                bail!(
                    "Duplicate user name '{}': each user must have a unique name",
                    user.username
                );
            }

            // 相同密码会得到相同凭证，无法区分用户
            if !seen_credentials.insert(credential_for(&user.password)) {
                bail!(
                    "User '{}' shares its password with another user: each user must have a unique password",
                    user.username
                );
            }
        }

        Ok(())
    }

    /// 验证规则列表
    pub fn validate_rules(rules: &[RuleConfig]) -> Result<()> {
        for (index, rule) in rules.iter().enumerate() {
            if let Err(e) = Rule::try_from(rule) {
                bail!("Rule #{}: {}", index + 1, e);
            }
        }
        Ok(())
    }

    /// 验证完整网关配置
    pub fn validate_gateway_config(config: &GatewayConfig) -> Result<()> {
        Self::validate_server_config(&config.server)?;
        Self::validate_users(&config.users)?;
        Self::validate_rules(&config.rules)?;
        Ok(())
    }
}
