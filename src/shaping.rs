/// 流量整形
///
/// 按一组随机扰动过的 (均值, 标准差) 桶把写入切成不同大小的片段，
/// 打乱固定大小的包长特征。整形参数在启动时生成一次，整个进程内保持不变
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;
use tracing::debug;

/// 基准桶：(均值, 标准差)
pub const BASELINE_BUCKETS: [(f64, f64); 8] = [
    (32.0, 4.0),
    (256.0, 16.0),
    (758.0, 32.0),
    (1024.0, 64.0),
    (2048.0, 128.0),
    (4096.0, 192.0),
    (16328.0, 1024.0),
    (65536.0, 2048.0),
];

/// 每个基准桶被丢弃的概率
const DROP_PROBABILITY: f64 = 0.5;

/// 不整形概率的下限
const SKIP_PROBABILITY_BASE: f64 = 0.4;

/// 整形桶
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    pub mean: f64,
    pub deviation: f64,
}

impl Bucket {
    pub fn new(mean: f64, deviation: f64) -> Self {
        Self { mean, deviation }
    }

    /// 剩余长度是否落在该桶的 50%~150% 区间内
    pub fn covers(&self, remaining: usize) -> bool {
        let remaining = remaining as f64;
        remaining >= 0.5 * self.mean && remaining <= 1.5 * self.mean
    }
}

/// 整形参数
#[derive(Debug, Clone, PartialEq)]
pub struct ShapingProfile {
    buckets: Vec<Bucket>,
    skip_probability: f64,
}

impl ShapingProfile {
    /// 直接指定参数（测试中用于注入确定的配置）
    pub fn new(buckets: Vec<Bucket>, skip_probability: f64) -> Self {
        Self {
            buckets,
            skip_probability: skip_probability.clamp(0.0, 1.0),
        }
    }

    /// 随机扰动基准表生成配置
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut buckets = Vec::with_capacity(BASELINE_BUCKETS.len());
        for (mean, deviation) in BASELINE_BUCKETS {
            if rng.random::<f64>() > DROP_PROBABILITY {
                buckets.push(Bucket {
                    mean: mean * (0.7 + 0.6 * rng.random::<f64>()),
                    deviation: deviation * (0.7 + 0.6 * rng.random::<f64>()),
                });
            }
        }
        let skip_probability =
            SKIP_PROBABILITY_BASE + (1.0 - SKIP_PROBABILITY_BASE) * rng.random::<f64>();

        let profile = Self {
            buckets,
            skip_probability,
        };
        debug!(
            "Shaping profile: {} buckets, skip probability {:.3}",
            profile.buckets.len(),
            profile.skip_probability
        );
        profile
    }

    /// 使用系统熵源生成
    pub fn random() -> Self {
        Self::generate(&mut StdRng::from_os_rng())
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn skip_probability(&self) -> f64 {
        self.skip_probability
    }

    /// 第一个覆盖剩余长度的桶
    pub fn bucket_for(&self, remaining: usize) -> Option<&Bucket> {
        self.buckets.iter().find(|bucket| bucket.covers(remaining))
    }

    /// 计算下一次写入的长度，结果在 `1..=remaining` 之间
    pub fn next_chunk<R: Rng + ?Sized>(&self, remaining: usize, rng: &mut R) -> usize {
        if remaining <= 1 || rng.random::<f64>() < self.skip_probability {
            return remaining;
        }
        let Some(bucket) = self.bucket_for(remaining) else {
            return remaining;
        };
        let Ok(normal) = Normal::new(bucket.mean, bucket.deviation) else {
            return remaining;
        };

        let cut = normal.sample(rng);
        if !cut.is_finite() || cut >= remaining as f64 {
            return remaining;
        }
        (cut as usize).max(1)
    }
}

/// 整形写入器
///
/// 每次 `poll_write` 最多写出 `next_chunk` 个字节，
/// 调用方（例如 `write_all`）会按短写继续写剩余部分
pub struct ShapedWriter<W> {
    inner: W,
    profile: Arc<ShapingProfile>,
    rng: StdRng,
    /// 上一次返回 Pending 时选定的长度，重试时沿用
    pending: Option<usize>,
}

impl<W> ShapedWriter<W> {
    pub fn new(inner: W, profile: Arc<ShapingProfile>) -> Self {
        Self::with_rng(inner, profile, StdRng::from_os_rng())
    }

    pub fn with_rng(inner: W, profile: Arc<ShapingProfile>, rng: StdRng) -> Self {
        Self {
            inner,
            profile,
            rng,
            pending: None,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ShapedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        let chunk = match this.pending {
            Some(chunk) => chunk.min(buf.len()),
            None => this.profile.next_chunk(buf.len(), &mut this.rng),
        };
        this.pending = Some(chunk);

        let result = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..chunk]));
        this.pending = None;
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
