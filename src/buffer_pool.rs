/// 复制缓冲区池
///
/// 为转发循环提供可复用的定长缓冲区，避免每个连接反复分配 64KB 内存。
/// 归还时不清零，调用方只能信任本次读取填充的前缀
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// 转发使用的传输单元大小（64KB）
pub const TRANSFER_UNIT: usize = 64 * 1024;

/// 默认最多保留的空闲缓冲区数量
pub const DEFAULT_MAX_IDLE: usize = 256;

struct PoolInner {
    idle: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_idle: usize,
}

/// 共享缓冲区池
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// 创建缓冲区池
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::new()),
                buffer_size,
                max_idle,
            }),
        }
    }

    /// 取出一个缓冲区，池为空时新建
    pub fn get(&self) -> PooledBuffer {
        let buf = self
            .inner
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.buffer_size]);

        PooledBuffer {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    /// 单个缓冲区大小
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// 当前空闲缓冲区数量
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.inner.buffer_size {
            return;
        }
        let mut idle = self.inner.idle.lock();
        if idle.len() < self.inner.max_idle {
            idle.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(TRANSFER_UNIT, DEFAULT_MAX_IDLE)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("max_idle", &self.inner.max_idle)
            .field("idle", &self.idle_count())
            .finish()
    }
}

/// 从池中借出的缓冲区，Drop 时自动归还
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: BufferPool,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}
