use super::ServerState;
use crate::context::RequestContext;
use crate::error::{GatewayError, Result};
use crate::protocol::Address;
use crate::relay::relay;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// 连接目标地址（域名交给系统解析）
pub async fn connect_target(target: &Address, timeout: Duration) -> Result<TcpStream> {
    let connect = async {
        match target {
            Address::Ip(addr) => TcpStream::connect(addr).await,
            Address::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
        }
    };

    let stream = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| GatewayError::timeout(timeout))?
        .map_err(|e| GatewayError::connect(target.to_string(), e))?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", target, e);
    }
    Ok(stream)
}

/// 处理 TCP CONNECT 请求
pub(super) async fn handle_tcp<S>(
    state: &ServerState,
    client: S,
    ctx: &mut RequestContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let outbound = connect_target(&ctx.target, state.config.connect_timeout()).await?;
    relay(client, outbound, ctx, state.shaping.clone(), &state.buffers).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_target_ip_and_domain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let by_ip = connect_target(&Address::Ip(addr), Duration::from_secs(2)).await;
        assert!(by_ip.is_ok());

        let by_name = connect_target(
            &Address::Domain("localhost".to_string(), addr.port()),
            Duration::from_secs(2),
        )
        .await;
        assert!(by_name.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect_target(&Address::Ip(addr), Duration::from_secs(2)).await;
        assert!(matches!(result, Err(GatewayError::Connect { .. })));
    }
}
