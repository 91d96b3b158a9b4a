/// 用量持久化
///
/// 文件格式：每个用户一行 `<credential> <usage>`，最后以一个空行结束
use super::UserRegistry;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 用量存储后端
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// 读取凭证 -> 用量
    async fn load(&self) -> Result<HashMap<String, u64>>;

    /// 覆盖写入全部用量
    async fn store(&self, usage: &HashMap<String, u64>) -> Result<()>;
}

/// 平面文件存储
#[derive(Debug, Clone)]
pub struct FileUsageStore {
    path: PathBuf,
}

impl FileUsageStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 解析文件内容，格式错误的行直接跳过
    pub fn parse(content: &str) -> HashMap<String, u64> {
        content
            .lines()
            .filter_map(|line| {
                let mut parts = line.split(' ');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(credential), Some(usage), None) if !credential.is_empty() => {
                        usage.parse().ok().map(|usage| (credential.to_string(), usage))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    /// 生成文件内容
    pub fn render(usage: &HashMap<String, u64>) -> String {
        let mut entries: Vec<_> = usage.iter().collect();
        entries.sort();

        let mut content = String::new();
        for (credential, bytes) in entries {
            content.push_str(&format!("{} {}\n", credential, bytes));
        }
        content.push('\n');
        content
    }
}

#[async_trait]
impl UsageStore for FileUsageStore {
    async fn load(&self) -> Result<HashMap<String, u64>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Usage file {} does not exist yet", self.path.display());
                Ok(HashMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, usage: &HashMap<String, u64>) -> Result<()> {
        tokio::fs::write(&self.path, Self::render(usage)).await?;
        Ok(())
    }
}

/// 把注册表当前用量写入存储
pub async fn flush_usage(registry: &UserRegistry, store: &dyn UsageStore) -> Result<()> {
    let snapshot = registry.snapshot();
    store.store(&snapshot).await?;
    debug!("Stored usage for {} users", snapshot.len());
    Ok(())
}

/// 启动周期性刷新任务，取消时再做最后一次刷新
pub fn spawn_usage_flusher(
    registry: Arc<UserRegistry>,
    store: Arc<dyn UsageStore>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // 第一次 tick 立即完成，跳过
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = flush_usage(&registry, store.as_ref()).await {
                        error!("Failed to store usage: {}", e);
                    }
                }
                _ = token.cancelled() => {
                    match flush_usage(&registry, store.as_ref()).await {
                        Ok(()) => info!("Final usage snapshot stored"),
                        Err(e) => warn!("Failed to store final usage snapshot: {}", e),
                    }
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Network, RequestContext};
    use crate::protocol::Address;
    use crate::registry::{credential_for, UserRecord};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tls-gate-{}-{}", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_render_format() {
        let mut usage = HashMap::new();
        usage.insert("b".repeat(56), 20);
        usage.insert("a".repeat(56), 10);
        let content = FileUsageStore::render(&usage);
        assert_eq!(
            content,
            format!("{} 10\n{} 20\n\n", "a".repeat(56), "b".repeat(56))
        );
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let content = "abc 12\nbroken\nxyz notanumber\ntoo many parts here\n\ndef 7\n";
        let usage = FileUsageStore::parse(content);
        assert_eq!(usage.len(), 2);
        assert_eq!(usage["abc"], 12);
        assert_eq!(usage["def"], 7);
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let store = FileUsageStore::new(temp_path("missing"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_registry() {
        let path = temp_path("usage");
        let store = FileUsageStore::new(&path);
        let cred = credential_for("pw");
        let registry = UserRegistry::new([UserRecord::new("alice", cred.clone(), 0)]);

        let mut ctx = RequestContext::new(
            "alice",
            cred.clone(),
            Address::Ip("1.1.1.1:80".parse().unwrap()),
            Network::Tcp,
        );
        ctx.sent = 300;
        ctx.received = 700;
        registry.record_usage(&ctx);

        flush_usage(&registry, &store).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.get(&cred), Some(&1000));

        let restored = UserRegistry::new([UserRecord::new("alice", cred.clone(), 0)]);
        restored.restore_usage(&loaded);
        assert_eq!(restored.get(&cred).unwrap().usage, 1000);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_flusher_stores_on_cancel() {
        let path = temp_path("flusher");
        let store = Arc::new(FileUsageStore::new(&path));
        let cred = credential_for("pw");
        let mut record = UserRecord::new("alice", cred.clone(), 0);
        record.usage = 55;
        let registry = Arc::new(UserRegistry::new([record]));

        let token = CancellationToken::new();
        let handle = spawn_usage_flusher(
            registry,
            store.clone(),
            Duration::from_secs(3600),
            token.clone(),
        );
        token.cancel();
        handle.await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.get(&cred), Some(&55));
        let _ = std::fs::remove_file(&path);
    }
}
