/// 双向转发
///
/// 两个方向各自独立复制，任一方向结束（EOF 或错误）后关闭自己的写端，
/// 并通过共享的取消令牌让另一个方向尽快停止
use crate::buffer_pool::BufferPool;
use crate::context::RequestContext;
use crate::shaping::{ShapedWriter, ShapingProfile};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 从 reader 复制到 writer，直到 EOF、出错或被取消，返回写出的字节数
///
/// 结束时取消令牌并关闭 writer
pub async fn copy_until_cancelled<R, W>(
    mut reader: R,
    mut writer: W,
    pool: &BufferPool,
    token: &CancellationToken,
    direction: &str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let mut total = 0u64;

    let copy = async {
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("{} read error: {}", direction, e);
                    break;
                }
            };
            if let Err(e) = writer.write_all(&buf[..n]).await {
                debug!("{} write error: {}", direction, e);
                break;
            }
            // WebSocket 等带缓冲的写端需要显式 flush
            if let Err(e) = writer.flush().await {
                debug!("{} flush error: {}", direction, e);
                break;
            }
            total += n as u64;
        }
    };

    tokio::select! {
        _ = copy => {}
        _ = token.cancelled() => {
            debug!("{} cancelled by the opposite direction", direction);
        }
    }

    // 先通知另一个方向，关闭写端可能因对端不读而阻塞
    token.cancel();
    let _ = writer.shutdown().await;
    total
}

/// 在两个流之间双向转发，返回 (客户端 -> 目标, 目标 -> 客户端) 的字节数
///
/// 阻塞直到两个方向都结束。提供整形参数时，下行方向经过整形写入器
pub async fn relay_streams<C, D>(
    client: C,
    dest: D,
    shaping: Option<Arc<ShapingProfile>>,
    pool: &BufferPool,
) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin,
    D: AsyncRead + AsyncWrite + Unpin,
{
    let (client_reader, client_writer) = tokio::io::split(client);
    let (dest_reader, dest_writer) = tokio::io::split(dest);
    let token = CancellationToken::new();

    let uplink = copy_until_cancelled(client_reader, dest_writer, pool, &token, "uplink");
    let downlink = async {
        match shaping {
            Some(profile) => {
                let shaped = ShapedWriter::new(client_writer, profile);
                copy_until_cancelled(dest_reader, shaped, pool, &token, "downlink").await
            }
            None => {
                copy_until_cancelled(dest_reader, client_writer, pool, &token, "downlink").await
            }
        }
    };

    tokio::join!(uplink, downlink)
}

/// 在客户端与目标之间双向转发
///
/// 把字节数写入 `ctx.sent` / `ctx.received`，返回目标 -> 客户端的字节数
pub async fn relay<C, D>(
    client: C,
    dest: D,
    ctx: &mut RequestContext,
    shaping: Option<Arc<ShapingProfile>>,
    pool: &BufferPool,
) -> u64
where
    C: AsyncRead + AsyncWrite + Unpin,
    D: AsyncRead + AsyncWrite + Unpin,
{
    let (sent, received) = relay_streams(client, dest, shaping, pool).await;
    ctx.sent = sent;
    ctx.received = received;
    received
}
