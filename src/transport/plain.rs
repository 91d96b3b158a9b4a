use super::{BoxedTransport, TransportServer, TransportType};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

/// 明文 TCP 传输服务器
///
/// 用于运行在终止 TLS 的反向代理之后
pub struct PlainTransportServer {
    listener: TcpListener,
    transport: TransportType,
}

impl PlainTransportServer {
    pub async fn bind(bind_addr: &str, bind_port: u16, transport: TransportType) -> Result<Self> {
        let addr = format!("{}:{}", bind_addr, bind_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        info!(
            "Plain transport server listening on {} (behind proxy)",
            listener.local_addr()?
        );

        Ok(Self {
            listener,
            transport,
        })
    }
}

#[async_trait]
impl TransportServer for PlainTransportServer {
    async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        self.listener
            .accept()
            .await
            .context("Failed to accept TCP connection")
    }

    async fn establish(&self, stream: TcpStream) -> Result<BoxedTransport> {
        let _ = stream.set_nodelay(true);
        Ok(Box::pin(stream))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read local address")
    }

    fn transport_type(&self) -> TransportType {
        self.transport
    }
}
