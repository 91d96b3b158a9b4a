use super::ServerState;
use crate::error::{GatewayError, Result};
use crate::relay::relay_streams;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// 把连接交给回落服务
///
/// `stream` 必须已经回退到起点，回落服务会收到客户端发送的全部原始字节。
/// 返回回落服务发给客户端的字节数
pub async fn fallback<S>(state: &ServerState, stream: S) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(addr) = state.config.fallback_addr.as_deref() else {
        return Err(GatewayError::config("fallback address is empty"));
    };

    let timeout = state.config.connect_timeout();
    let outbound = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| GatewayError::timeout(timeout))?
        .map_err(|e| GatewayError::connect(addr, e))?;
    let _ = outbound.set_nodelay(true);

    debug!("Relaying to fallback {}", addr);
    let (sent, received) = relay_streams(stream, outbound, None, &state.buffers).await;
    debug!(
        "Fallback finished: {} bytes to {}, {} bytes back",
        sent, addr, received
    );
    Ok(received)
}
