/// 可回放的字节流
///
/// 包装底层连接：握手阶段缓存读到的所有字节，握手失败时可以回退（rewind）
/// 并把这些字节原样重放给回落服务，握手成功后停止缓存并直接透传
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::warn;

/// 默认的握手缓存大小
pub const DEFAULT_REWIND_BUFFER: usize = 2048;

/// 缓存状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// 从未开启缓存
    Idle,
    /// 正在缓存读到的字节
    Buffering,
    /// 已停止缓存，保留已缓存的前缀
    Frozen,
    /// 缓存已释放
    Released,
}

/// 可回放流
pub struct RewindStream<S> {
    inner: S,
    buf: Vec<u8>,
    read_pos: usize,
    size_hint: usize,
    state: BufferState,
    replaying: bool,
    oversize_logged: bool,
}

impl<S> RewindStream<S> {
    /// 创建不缓存的流
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            read_pos: 0,
            size_hint: 0,
            state: BufferState::Idle,
            replaying: false,
            oversize_logged: false,
        }
    }

    /// 创建并立即开启缓存（size_hint 为 0 时使用默认值）
    pub fn with_buffer(inner: S, size_hint: usize) -> Self {
        let size_hint = if size_hint == 0 {
            DEFAULT_REWIND_BUFFER
        } else {
            size_hint
        };
        let mut stream = Self::new(inner);
        stream.buf = Vec::with_capacity(size_hint);
        stream.size_hint = size_hint;
        stream.state = BufferState::Buffering;
        stream
    }

    /// 开启缓存，只能在从未缓存过的流上调用
    pub fn enable_buffering(&mut self, size_hint: usize) -> io::Result<()> {
        if size_hint == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "rewind buffer size must be greater than 0",
            ));
        }
        if self.state != BufferState::Idle {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffering cannot be enabled in state {:?}", self.state),
            ));
        }
        self.buf = Vec::with_capacity(size_hint);
        self.read_pos = 0;
        self.size_hint = size_hint;
        self.state = BufferState::Buffering;
        Ok(())
    }

    /// 停止缓存，已缓存的字节保留以便回放（不可逆）
    pub fn stop_buffering(&mut self) {
        if self.state == BufferState::Buffering {
            self.state = BufferState::Frozen;
        }
    }

    /// 释放缓存，之后不能再 rewind
    pub fn release_buffer(&mut self) {
        self.buf = Vec::new();
        self.read_pos = 0;
        self.replaying = false;
        self.state = BufferState::Released;
    }

    /// 释放已经重放过的缓存
    ///
    /// 尚未重放的尾部保留，读完后自动释放；不在重放中时等同于 `release_buffer`
    pub fn release_replayed(&mut self) {
        if self.replaying && self.read_pos < self.buf.len() {
            self.buf.drain(..self.read_pos);
            self.buf.shrink_to_fit();
            self.read_pos = 0;
            self.state = BufferState::Released;
        } else {
            self.release_buffer();
        }
    }

    /// 回到缓存起点，后续读取先重放缓存再透传
    ///
    /// 没有保留缓存时返回 `InvalidInput`
    pub fn rewind(&mut self) -> io::Result<()> {
        match self.state {
            BufferState::Buffering | BufferState::Frozen => {
                self.replaying = true;
                self.read_pos = 0;
                Ok(())
            }
            BufferState::Idle | BufferState::Released => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no buffered data to rewind",
            )),
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn is_buffering(&self) -> bool {
        self.state == BufferState::Buffering
    }

    /// 已缓存的字节
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> RewindStream<S> {
    /// 读取单个字节
    pub async fn read_byte(&mut self) -> io::Result<u8> {
        self.read_u8().await
    }

    /// 丢弃 n 个字节，返回实际丢弃的数量（遇到 EOF 时可能小于 n）
    pub async fn discard(&mut self, n: usize) -> io::Result<usize> {
        let mut scratch = [0u8; 128];
        let mut discarded = 0;
        while discarded < n {
            let want = (n - discarded).min(scratch.len());
            let read = self.read(&mut scratch[..want]).await?;
            if read == 0 {
                break;
            }
            discarded += read;
        }
        Ok(discarded)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.replaying {
            if this.read_pos < this.buf.len() {
                let n = out.remaining().min(this.buf.len() - this.read_pos);
                out.put_slice(&this.buf[this.read_pos..this.read_pos + n]);
                this.read_pos += n;
                return Poll::Ready(Ok(()));
            }
            this.replaying = false;
            if this.state == BufferState::Released {
                this.buf = Vec::new();
                this.read_pos = 0;
            }
        }

        let before = out.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, out))?;

        if this.state == BufferState::Buffering {
            this.buf.extend_from_slice(&out.filled()[before..]);
            if this.buf.len() > this.size_hint * 2 && !this.oversize_logged {
                this.oversize_logged = true;
                warn!(
                    "Rewind buffer grew to {} bytes (hint: {} bytes)",
                    this.buf.len(),
                    this.size_hint
                );
            }
        }

        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
