/// 单个连接的处理流程
///
/// 建立传输层 -> （可选）WebSocket 升级 -> 握手 -> TCP 转发或 UDP 会话；
/// 握手阶段的任何失败都把已读字节回放给回落服务
use super::{fallback, tcp, udp, ServerState};
use crate::context::Network;
use crate::error::{GatewayError, Result};
use crate::limited_reader::LimitedReader;
use crate::protocol::read_request;
use crate::rewind::{RewindStream, DEFAULT_REWIND_BUFFER};
use crate::transport::{upgrade, TransportServer, TransportType, Upgrade};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// 处理一个刚接受的 TCP 连接
pub async fn handle_connection(
    state: &ServerState,
    transport: &dyn TransportServer,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let timeout = state.config.handshake_timeout();
    let established = match tokio::time::timeout(timeout, transport.establish(stream)).await {
        Ok(Ok(established)) => established,
        Ok(Err(e)) => {
            // TLS 层失败时没有可回放的明文
            debug!("Transport establishment failed: {:#}", e);
            return Ok(());
        }
        Err(_) => {
            debug!("Transport establishment timed out after {:?}", timeout);
            return Ok(());
        }
    };

    match transport.transport_type() {
        TransportType::Tls => serve_gateway(state, established, peer).await,
        TransportType::Wss => match upgrade(established, &state.config.ws_path, timeout).await? {
            Upgrade::Accepted(ws) => serve_gateway(state, ws, peer).await,
            Upgrade::Rejected { stream, reason } => {
                info!("[websocket] {}", reason);
                if let Err(e) = fallback(state, stream).await {
                    info!("[fallback] {}", e);
                }
                Ok(())
            }
        },
    }
}

/// 在已建立的字节流上执行握手并转发
pub async fn serve_gateway<S>(state: &ServerState, stream: S, peer: SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut stream = RewindStream::with_buffer(stream, DEFAULT_REWIND_BUFFER);
    let timeout = state.config.handshake_timeout();

    let result = {
        let mut limited = LimitedReader::for_handshake(&mut stream);
        match tokio::time::timeout(
            timeout,
            read_request(&mut limited, &state.registry, &state.rules),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::timeout(timeout)),
        }
    };
    stream.stop_buffering();

    let mut ctx = match result {
        Ok(ctx) => ctx,
        Err(e) if e.is_handshake_error() => {
            info!("Request error from {}: {}", peer, e);
            stream.rewind()?;
            if let Err(e) = fallback(state, stream).await {
                info!("[fallback] {}", e);
            }
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    stream.release_buffer();

    // 握手期间其他连接可能已经用完配额
    if !state.registry.check_usage(&ctx.credential) {
        return Err(GatewayError::quota_exceeded(ctx.username));
    }

    debug!("{}", ctx.describe(peer));
    let result = match ctx.network {
        Network::Tcp => tcp::handle_tcp(state, stream, &mut ctx).await,
        Network::Udp => udp::handle_udp(state, stream, &mut ctx).await,
    };

    state.registry.record_usage(&ctx);
    debug!(
        "[close] {} sent: {} bytes, received: {} bytes",
        ctx.describe(peer),
        ctx.sent,
        ctx.received
    );
    result
}
