/// WebSocket 传输层
///
/// 在 TLS 连接上先读取 HTTP 请求头：路径与 `Upgrade` 都匹配时完成 WebSocket 升级，
/// 并把消息流转换成字节流；否则把读到的字节原样交回，由调用方回落
use crate::error::{GatewayError, Result};
use crate::limited_reader::LimitedReader;
use crate::rewind::{RewindStream, DEFAULT_REWIND_BUFFER};
use bytes::{Buf, Bytes};
use futures::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, trace};

/// 请求头中最多解析的头部数量
const MAX_HEADERS: usize = 64;

/// 升级结果
pub enum Upgrade<S> {
    /// 升级成功
    Accepted(WsStream<RewindStream<S>>),
    /// 不是发往本路径的 WebSocket 请求，流已回退到起点
    Rejected {
        stream: RewindStream<S>,
        reason: String,
    },
}

/// 解析出的请求头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub upgrade: Option<String>,
}

impl RequestHead {
    /// 解析 HTTP 请求头，数据还不完整时返回 `Ok(None)`
    pub fn parse(buf: &[u8]) -> std::result::Result<Option<Self>, httparse::Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        if request.parse(buf)?.is_partial() {
            return Ok(None);
        }

        let target = request.path.unwrap_or_default();
        let upgrade = request
            .headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case("upgrade"))
            .map(|header| String::from_utf8_lossy(header.value).trim().to_string());

        Ok(Some(Self {
            method: request.method.unwrap_or_default().to_string(),
            path: target.split('?').next().unwrap_or(target).to_string(),
            upgrade,
        }))
    }

    /// 是否为发往 `path` 的 WebSocket 升级请求
    pub fn is_websocket_to(&self, path: &str) -> bool {
        self.path == path
            && self
                .upgrade
                .as_deref()
                .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }
}

/// 读取直到请求头完整
///
/// 可能多读到请求体或首个帧，调用方总会回退；长度上限由外层的 `LimitedReader` 控制
async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<RequestHead> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        match RequestHead::parse(&buf) {
            Ok(Some(head)) => return Ok(head),
            Ok(None) => trace!("Partial request head: {} bytes", buf.len()),
            Err(e) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("malformed http request: {}", e),
                ))
            }
        }
    }
}

/// 尝试在 `stream` 上完成发往 `path` 的 WebSocket 升级
///
/// 读取请求头失败、超时或不匹配时返回 `Rejected`；
/// 请求头匹配但升级本身失败时返回错误（此时已无法回落）
pub async fn upgrade<S>(stream: S, path: &str, timeout: Duration) -> Result<Upgrade<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut rewind = RewindStream::with_buffer(stream, DEFAULT_REWIND_BUFFER);

    let head = {
        let mut limited = LimitedReader::with_header_limit(&mut rewind);
        tokio::time::timeout(timeout, read_head(&mut limited)).await
    };
    rewind.stop_buffering();

    let reason = match head {
        Ok(Ok(request)) if request.is_websocket_to(path) => None,
        Ok(Ok(request)) => Some(format!(
            "url is not match: {} {} (upgrade: {:?})",
            request.method, request.path, request.upgrade
        )),
        Ok(Err(e)) => Some(format!("failed to read http request: {}", e)),
        Err(_) => Some(format!("http request not received within {:?}", timeout)),
    };

    rewind.rewind()?;

    if let Some(reason) = reason {
        return Ok(Upgrade::Rejected {
            stream: rewind,
            reason,
        });
    }

    let mut ws = tokio::time::timeout(timeout, accept_async(rewind))
        .await
        .map_err(|_| GatewayError::timeout(timeout))?
        .map_err(|e| GatewayError::Transport(format!("WebSocket handshake failed: {}", e)))?;
    // 请求头已交给 tungstenite，不再需要回退
    ws.get_mut().release_replayed();
    debug!("WebSocket upgrade completed on {}", path);

    Ok(Upgrade::Accepted(WsStream::new(ws)))
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::other(e.to_string())
}

/// 把 WebSocket 消息流转换为 AsyncRead + AsyncWrite
///
/// 每次写入发送一个二进制消息；读取时拼接二进制或文本消息的内容
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    pending: Bytes,
    closed: bool,
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            closed: false,
        }
    }

    pub fn get_ref(&self) -> &WebSocketStream<S> {
        &self.inner
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.closed {
                return Poll::Ready(Ok(()));
            }

            let message = match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(message))) => message,
                Poll::Ready(Some(Err(e))) => {
                    this.closed = true;
                    return Poll::Ready(Err(ws_error(e)));
                }
                Poll::Ready(None) => {
                    this.closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            };

            match message {
                Message::Binary(data) => this.pending = data,
                Message::Text(text) => this.pending = Bytes::copy_from_slice(text.as_bytes()),
                Message::Close(frame) => {
                    debug!("WebSocket received close frame: {:?}", frame);
                    this.closed = true;
                }
                // ping 由 tungstenite 自动回复
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("WebSocket control message skipped");
                }
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "WebSocket connection closed",
            )));
        }

        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(ws_error(e))),
            Poll::Pending => return Poll::Pending,
        }

        Pin::new(&mut this.inner)
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(ws_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(ws_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // 发送 close 帧
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(ws_error)
    }
}
