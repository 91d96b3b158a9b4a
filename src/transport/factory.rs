// 传输层工厂 - 根据配置创建传输实例

use crate::config::ServerConfig;
use crate::transport::{PlainTransportServer, TlsTransportServer, TransportServer};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// 创建传输层服务器
///
/// 提供 TLS 接收器时使用 TLS，否则（运行在反向代理后）使用明文 TCP
pub async fn create_transport_server(
    config: &ServerConfig,
    acceptor: Option<TlsAcceptor>,
) -> Result<Arc<dyn TransportServer>> {
    let server: Arc<dyn TransportServer> = match acceptor {
        Some(acceptor) => {
            let server = TlsTransportServer::bind(
                &config.bind_addr,
                config.bind_port,
                acceptor,
                config.transport,
            )
            .await
            .context("Failed to bind TLS transport server")?;
            Arc::new(server)
        }
        None => {
            let server =
                PlainTransportServer::bind(&config.bind_addr, config.bind_port, config.transport)
                    .await
                    .context("Failed to bind plain transport server")?;
            Arc::new(server)
        }
    };

    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_plain_server_accepts() {
        let mut config = ServerConfig::builder()
            .bind_addr("127.0.0.1")
            .bind_port(8443)
            .transport(TransportType::Wss)
            .build()
            .unwrap();
        // 使用系统分配的端口
        config.bind_port = 0;

        let server = create_transport_server(&config, None).await.unwrap();
        assert_eq!(server.transport_type(), TransportType::Wss);
        let addr = server.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let (stream, _peer) = server.accept().await.unwrap();
        let mut transport = server.establish(stream).await.unwrap();
        let mut buf = [0u8; 4];
        transport.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }
}
