/// 有限读取器模块
///
/// 握手和 WebSocket 请求头都通过它读取，防止客户端用超长请求耗尽内存
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// 握手阶段最多读取的字节数（8KB）
pub const HANDSHAKE_LIMIT: usize = 8 * 1024;

/// HTTP 请求头最大大小（8KB）
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8 * 1024;

/// 有限读取器 - 限制可以读取的最大字节数
pub struct LimitedReader<R> {
    inner: R,
    remaining: usize,
    limit: usize,
}

impl<R> LimitedReader<R> {
    pub fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            remaining: limit,
            limit,
        }
    }

    /// 使用握手大小限制
    pub fn for_handshake(inner: R) -> Self {
        Self::new(inner, HANDSHAKE_LIMIT)
    }

    /// 使用 HTTP 头大小限制
    pub fn with_header_limit(inner: R) -> Self {
        Self::new(inner, DEFAULT_MAX_HEADER_SIZE)
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 已读取字节数
    pub fn read_count(&self) -> usize {
        self.limit - self.remaining
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LimitedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("read limit exceeded ({} bytes)", self.limit),
            )));
        }

        let limit = self.remaining.min(buf.remaining());
        let read = {
            let mut limited = ReadBuf::new(buf.initialize_unfilled_to(limit));
            match Pin::new(&mut self.inner).poll_read(cx, &mut limited) {
                Poll::Ready(Ok(())) => limited.filled().len(),
                other => return other,
            }
        };

        // 临时视图与外层缓冲区相互独立，需要手动推进
        buf.advance(read);
        self.remaining = self.remaining.saturating_sub(read);
        Poll::Ready(Ok(()))
    }
}
