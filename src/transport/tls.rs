use super::{BoxedTransport, TransportServer, TransportType};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// TLS 传输服务器
pub struct TlsTransportServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    transport: TransportType,
}

impl TlsTransportServer {
    pub async fn bind(
        bind_addr: &str,
        bind_port: u16,
        acceptor: TlsAcceptor,
        transport: TransportType,
    ) -> Result<Self> {
        let addr = format!("{}:{}", bind_addr, bind_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        info!("TLS transport server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            acceptor,
            transport,
        })
    }
}

#[async_trait]
impl TransportServer for TlsTransportServer {
    async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        self.listener
            .accept()
            .await
            .context("Failed to accept TCP connection")
    }

    async fn establish(&self, stream: TcpStream) -> Result<BoxedTransport> {
        let _ = stream.set_nodelay(true);
        let tls_stream = self
            .acceptor
            .accept(stream)
            .await
            .context("TLS handshake failed")?;

        let (_, session) = tls_stream.get_ref();
        debug!(
            "TLS handshake completed (alpn: {:?})",
            session
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned())
        );
        Ok(Box::pin(tls_stream))
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
