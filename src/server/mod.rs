pub mod connection;
mod fallback;
mod tcp;
mod udp;

pub use connection::{handle_connection, serve_gateway};
pub use fallback::fallback;
pub use tcp::connect_target;
pub use udp::{handle_udp, UdpRelaySocket};

use crate::buffer_pool::BufferPool;
use crate::config::{GatewayConfig, ServerConfig};
use crate::rate_limiter::RateLimiter;
use crate::registry::{spawn_usage_flusher, FileUsageStore, UsageStore, UserRegistry};
use crate::rules::RuleEngine;
use crate::shaping::ShapingProfile;
use crate::tls::build_acceptor;
use crate::transport::{create_transport_server, TransportServer};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

/// 清理速率限制器中过期来源的间隔
const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// 服务器依赖（用于依赖注入）
pub struct ServerDependencies {
    pub registry: Arc<UserRegistry>,
    pub rules: RuleEngine,
    pub shaping: Option<Arc<ShapingProfile>>,
    pub usage_store: Option<Arc<dyn UsageStore>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

impl ServerDependencies {
    /// 根据配置创建依赖
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let registry = Arc::new(UserRegistry::from_config(&config.users));
        let rules = RuleEngine::from_config(&config.rules).context("Failed to load rules")?;

        let shaping = config
            .server
            .reshape
            .then(|| Arc::new(ShapingProfile::random()));

        let usage_store = config.server.usage_file.as_ref().map(|path| {
            let path = shellexpand::tilde(&path.to_string_lossy()).into_owned();
            Arc::new(FileUsageStore::new(path)) as Arc<dyn UsageStore>
        });

        // 根据配置创建速率限制器
        let rate_limiter = match config.server.rate_limit {
            Some(ref cfg) => Some(Arc::new(
                RateLimiter::new(cfg.clone()).context("Invalid rate limit")?,
            )),
            None => None,
        };

        Ok(Self {
            registry,
            rules,
            shaping,
            usage_store,
            rate_limiter,
        })
    }
}

/// 服务器状态，所有连接共享
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<UserRegistry>,
    pub rules: RuleEngine,
    pub shaping: Option<Arc<ShapingProfile>>,
    pub buffers: BufferPool,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

impl ServerState {
    /// 从配置和依赖创建状态
    pub fn with_dependencies(config: ServerConfig, deps: &ServerDependencies) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::clone(&deps.registry),
            rules: deps.rules.clone(),
            shaping: deps.shaping.clone(),
            buffers: BufferPool::default(),
            rate_limiter: deps.rate_limiter.clone(),
        }
    }
}

/// 已绑定监听端口、尚未开始接收连接的网关
pub struct Gateway {
    state: Arc<ServerState>,
    transport: Arc<dyn TransportServer>,
    usage_store: Option<Arc<dyn UsageStore>>,
}

impl Gateway {
    /// 根据配置创建并绑定
    pub async fn bind(config: GatewayConfig) -> Result<Self> {
        let deps = ServerDependencies::from_config(&config)?;
        Self::bind_with_dependencies(config.server, deps).await
    }

    /// 使用自定义依赖创建并绑定（用于测试）
    pub async fn bind_with_dependencies(
        config: ServerConfig,
        deps: ServerDependencies,
    ) -> Result<Self> {
        if let Some(ref store) = deps.usage_store {
            let usage = store.load().await.context("Failed to load usage file")?;
            deps.registry.restore_usage(&usage);
            info!("Restored usage for {} credentials", usage.len());
        }

        let acceptor = build_acceptor(&config).context("Failed to set up TLS")?;
        let transport = create_transport_server(&config, acceptor)
            .await
            .context("Failed to create transport server")?;

        Ok(Self {
            state: Arc::new(ServerState::with_dependencies(config, &deps)),
            transport,
            usage_store: deps.usage_store,
        })
    }

    /// 实际监听的地址
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// 接收连接直到 `shutdown` 被取消
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let state = self.state;
        let transport = self.transport;

        info!(
            "Gateway listening on {} (transport: {}, users: {}, rules: {}, reshape: {})",
            transport.local_addr()?,
            transport.transport_type(),
            state.registry.len(),
            state.rules.rules().len(),
            state.shaping.is_some()
        );
        match state.config.fallback_addr {
            Some(ref addr) => info!("Fallback target: {}", addr),
            None => warn!("No fallback target, failed handshakes will be closed"),
        }

        let flusher = self.usage_store.map(|store| {
            spawn_usage_flusher(
                Arc::clone(&state.registry),
                store,
                state.config.usage_flush_interval(),
                shutdown.child_token(),
            )
        });

        let mut cleanup = tokio::time::interval(LIMITER_CLEANUP_INTERVAL);

        loop {
            tokio::select! {
                _ = cleanup.tick() => {
                    if let Some(ref limiter) = state.rate_limiter {
                        limiter.retain_recent();
                    }
                }
                result = transport.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            // 应用速率限制
                            if let Some(ref limiter) = state.rate_limiter {
                                if let Err(wait_time) = limiter.check(peer.ip()) {
                                    warn!(
                                        "Rate limit exceeded, rejecting connection from {} (retry after {:?})",
                                        peer, wait_time
                                    );
                                    continue;
                                }
                            }

                            let state = Arc::clone(&state);
                            let transport = Arc::clone(&transport);
                            let span = tracing::info_span!(
                                "conn",
                                id = %uuid::Uuid::new_v4(),
                                peer = %peer
                            );

                            tokio::spawn(
                                async move {
                                    if let Err(e) = handle_connection(&state, transport.as_ref(), stream, peer).await {
                                        warn!("Connection error: {}", e);
                                    }
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Received shutdown signal, stopping gateway...");
                    break;
                }
            }
        }

        if let Some(handle) = flusher {
            if let Err(e) = handle.await {
                warn!("Usage flusher task failed: {}", e);
            }
        }
        info!("Gateway stopped gracefully");
        Ok(())
    }
}

/// 运行网关直到收到 Ctrl+C
pub async fn run_server(config: GatewayConfig) -> Result<()> {
    let gateway = Gateway::bind(config).await?;
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        signal.cancel();
    });

    info!("Waiting for client connections... (Press Ctrl+C to stop)");
    gateway.run(shutdown).await
}
