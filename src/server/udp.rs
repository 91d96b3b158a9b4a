/// UDP over TCP 会话
///
/// 每个会话使用一个独立的出站 UDP socket。上行方向从隧道读取数据报，
/// 逐个重新检查访问规则后发出；下行方向把收到的数据报连同来源地址封装写回隧道
use super::ServerState;
use crate::buffer_pool::BufferPool;
use crate::context::{Network, RequestContext};
use crate::error::{GatewayError, Result};
use crate::protocol::{encode_envelope, read_envelope, Address};
use crate::rules::RuleEngine;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 出站 UDP socket
///
/// 优先使用双栈 IPv6 socket，不可用时退回 IPv4
pub struct UdpRelaySocket {
    socket: UdpSocket,
    dual_stack: bool,
}

impl UdpRelaySocket {
    /// 绑定到任意端口
    pub fn bind() -> io::Result<Self> {
        match Self::bind_dual_stack() {
            Ok(socket) => Ok(Self {
                socket,
                dual_stack: true,
            }),
            Err(e) => {
                debug!("Dual-stack UDP socket unavailable ({}), using IPv4", e);
                let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
                socket.set_nonblocking(true)?;
                Ok(Self {
                    socket: UdpSocket::from_std(socket)?,
                    dual_stack: false,
                })
            }
        }
    }

    fn bind_dual_stack() -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_only_v6(false)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).into())?;
        UdpSocket::from_std(socket.into())
    }

    pub fn is_dual_stack(&self) -> bool {
        self.dual_stack
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// 发送数据报，双栈 socket 上的 IPv4 目标转换为映射地址
    pub async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        let target = match target {
            SocketAddr::V4(v4) if self.dual_stack => {
                SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
            }
            other => other,
        };
        self.socket.send_to(payload, target).await
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

/// 处理 UDP ASSOCIATE 请求
pub async fn handle_udp<S>(state: &ServerState, client: S, ctx: &mut RequestContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let socket = UdpRelaySocket::bind()?;
    debug!(
        "UDP session for [{}] bound to {} (dual stack: {})",
        ctx.username,
        socket.local_addr()?,
        socket.is_dual_stack()
    );

    let (sent, received) = run_session(
        client,
        &socket,
        &state.rules,
        ctx,
        &state.buffers,
        state.config.udp_idle_timeout(),
    )
    .await;
    ctx.sent = sent;
    ctx.received = received;
    Ok(())
}

/// 运行会话直到任一方向结束，返回 (上行负载字节数, 下行写回字节数)
pub(crate) async fn run_session<S>(
    client: S,
    socket: &UdpRelaySocket,
    rules: &RuleEngine,
    ctx: &RequestContext,
    pool: &BufferPool,
    idle_timeout: Duration,
) -> (u64, u64)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(client);
    let token = CancellationToken::new();

    tokio::join!(
        uplink(reader, socket, rules, ctx, &token, idle_timeout),
        downlink(writer, socket, pool, &token, idle_timeout),
    )
}

/// 隧道 -> 目标
async fn uplink<R>(
    mut reader: R,
    socket: &UdpRelaySocket,
    rules: &RuleEngine,
    ctx: &RequestContext,
    token: &CancellationToken,
    idle_timeout: Duration,
) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut sent = 0u64;

    let pump = async {
        loop {
            let envelope = match tokio::time::timeout(idle_timeout, read_envelope(&mut reader)).await
            {
                Ok(Ok(envelope)) => envelope,
                Ok(Err(e)) => {
                    debug!("UDP uplink ended: {}", e);
                    break;
                }
                Err(_) => {
                    debug!("UDP uplink idle for {:?}", idle_timeout);
                    break;
                }
            };

            // 每个数据报的目标都可能不同，需要单独检查规则
            let datagram = RequestContext::new(
                ctx.username.clone(),
                ctx.credential.clone(),
                envelope.target.clone(),
                Network::Udp,
            );
            if !rules.evaluate(&datagram).await {
                info!(
                    "{}",
                    GatewayError::policy_denied(ctx.username.clone(), envelope.target.to_string())
                );
                continue;
            }

            let target = match envelope.target.resolve().await {
                Ok(target) => target,
                Err(e) => {
                    debug!("Failed to resolve {}: {}", envelope.target, e);
                    continue;
                }
            };

            match socket.send_to(&envelope.payload, target).await {
                Ok(n) => sent += n as u64,
                Err(e) => debug!("Failed to send datagram to {}: {}", target, e),
            }
        }
    };

    tokio::select! {
        _ = pump => {}
        _ = token.cancelled() => {}
    }
    token.cancel();
    sent
}

/// 目标 -> 隧道
async fn downlink<W>(
    mut writer: W,
    socket: &UdpRelaySocket,
    pool: &BufferPool,
    token: &CancellationToken,
    idle_timeout: Duration,
) -> u64
where
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let mut received = 0u64;

    let pump = async {
        loop {
            let (n, from) =
                match tokio::time::timeout(idle_timeout, socket.recv_from(&mut buf)).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => {
                        debug!("UDP downlink receive error: {}", e);
                        break;
                    }
                    Err(_) => {
                        debug!("UDP downlink idle for {:?}", idle_timeout);
                        break;
                    }
                };

            let envelope = match encode_envelope(&Address::from(from), &buf[..n]) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!("Dropping datagram from {}: {}", from, e);
                    continue;
                }
            };

            if let Err(e) = writer.write_all(&envelope).await {
                debug!("UDP downlink write error: {}", e);
                break;
            }
            if let Err(e) = writer.flush().await {
                debug!("UDP downlink flush error: {}", e);
                break;
            }
            received += envelope.len() as u64;
        }
    };

    tokio::select! {
        _ = pump => {}
        _ = token.cancelled() => {}
    }
    token.cancel();
    let _ = writer.shutdown().await;
    received
}
