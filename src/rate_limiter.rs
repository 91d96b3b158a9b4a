/// 速率限制器模块
///
/// 使用 token bucket 算法限制新连接速率，防止大量探测连接耗尽资源。
/// 全局限制之外可以再按来源 IP 单独限制
use crate::config::RateLimitConfig;
use crate::error::{GatewayError, Result};
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    DefaultKeyedRateLimiter, Quota, RateLimiter as GovernorLimiter,
};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

fn non_zero(value: u32, name: &str) -> Result<NonZeroU32> {
    NonZeroU32::new(value)
        .ok_or_else(|| GatewayError::config(format!("rate_limit.{} must be > 0", name)))
}

/// 连接速率限制器
pub struct RateLimiter {
    global: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    per_peer: Option<Arc<DefaultKeyedRateLimiter<IpAddr>>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// 创建新的速率限制器
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        let quota = Quota::per_second(non_zero(config.requests_per_second, "requests_per_second")?)
            .allow_burst(non_zero(config.burst_size, "burst_size")?);

        let per_peer = match config.per_peer_per_second {
            Some(rate) => {
                let quota = Quota::per_second(non_zero(rate, "per_peer_per_second")?);
                Some(Arc::new(GovernorLimiter::keyed(quota)))
            }
            None => None,
        };

        Ok(Self {
            global: Arc::new(GovernorLimiter::direct(quota)),
            per_peer,
            config,
        })
    }

    /// 创建默认配置的速率限制器
    pub fn with_defaults() -> Result<Self> {
        Self::new(RateLimitConfig::default())
    }

    /// 尝试为来自 `peer` 的新连接获取一个令牌（非阻塞）
    ///
    /// 被限流时返回需要等待的时间
    pub fn check(&self, peer: IpAddr) -> std::result::Result<(), Duration> {
        let now = DefaultClock::default().now();
        if let Some(ref per_peer) = self.per_peer {
            if let Err(not_until) = per_peer.check_key(&peer) {
                return Err(not_until.wait_time_from(now));
            }
        }
        self.global
            .check()
            .map_err(|not_until| not_until.wait_time_from(now))
    }

    /// 清理长时间未出现的来源
    pub fn retain_recent(&self) {
        if let Some(ref per_peer) = self.per_peer {
            per_peer.retain_recent();
        }
    }

    /// 获取配置信息
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            global: Arc::clone(&self.global),
            per_peer: self.per_peer.clone(),
            config: self.config.clone(),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}
