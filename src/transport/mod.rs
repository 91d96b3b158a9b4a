mod factory;
mod plain;
mod tls;
pub mod wss;

pub use factory::create_transport_server;
pub use plain::PlainTransportServer;
pub use tls::TlsTransportServer;
pub use wss::{upgrade, Upgrade, WsStream};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// 传输层类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// TCP + TLS（原生方式）
    #[default]
    Tls,
    /// TLS 之上的 WebSocket
    Wss,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Tls => write!(f, "tls"),
            TransportType::Wss => write!(f, "wss"),
        }
    }
}

impl std::str::FromStr for TransportType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tls" => Ok(Self::Tls),
            "wss" | "websocket" => Ok(Self::Wss),
            _ => anyhow::bail!("Unknown transport type: {}", s),
        }
    }
}

/// 传输层连接抽象
///
/// 统一封装不同传输方式（明文 TCP、TLS）的连接
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 已建立的传输层连接
pub type BoxedTransport = Pin<Box<dyn Transport>>;

/// 传输层服务器接口
///
/// `accept` 只负责接收 TCP 连接，必须足够快；
/// 加密握手等耗时操作放在 `establish` 中，由每个连接自己的任务执行
#[async_trait]
pub trait TransportServer: Send + Sync {
    /// 接受新的 TCP 连接
    async fn accept(&self) -> Result<(TcpStream, SocketAddr)>;

    /// 在已接受的连接上建立传输层（例如 TLS 握手）
    async fn establish(&self, stream: TcpStream) -> Result<BoxedTransport>;

    /// 实际监听的地址
    fn local_addr(&self) -> Result<SocketAddr>;

    /// 获取传输类型
    fn transport_type(&self) -> TransportType;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_type_parse() {
        assert_eq!("tls".parse::<TransportType>().unwrap(), TransportType::Tls);
        assert_eq!("WSS".parse::<TransportType>().unwrap(), TransportType::Wss);
        assert_eq!(
            "websocket".parse::<TransportType>().unwrap(),
            TransportType::Wss
        );
        assert!("http2".parse::<TransportType>().is_err());
        assert_eq!(TransportType::Wss.to_string(), "wss");
    }
}
