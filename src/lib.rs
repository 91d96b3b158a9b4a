/// TLS Gate 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod buffer_pool;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod limited_reader;
pub mod protocol;
pub mod rate_limiter;
pub mod registry;
pub mod relay;
pub mod rewind;
pub mod rules;
pub mod server;
pub mod shaping;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use buffer_pool::BufferPool;
pub use config::{GatewayConfig, RateLimitConfig, RuleConfig, ServerConfig, UserConfig};
pub use context::{Network, RequestContext};
pub use error::{GatewayError, Result};
pub use limited_reader::{LimitedReader, DEFAULT_MAX_HEADER_SIZE, HANDSHAKE_LIMIT};
pub use protocol::Address;
pub use rate_limiter::RateLimiter;
pub use registry::{credential_for, UserRecord, UserRegistry};
pub use rewind::RewindStream;
pub use rules::{Rule, RuleEngine};
pub use server::{run_server, Gateway, ServerDependencies, ServerState};
pub use shaping::ShapingProfile;
