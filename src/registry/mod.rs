/// 用户注册表与配额控制
///
/// 凭证（SHA-224 十六进制）映射到用户记录，用量在连接关闭时累加，
/// 配额只在握手时检查，所以单个长连接可以超出配额
pub mod store;

use crate::config::UserConfig;
use crate::context::RequestContext;
use parking_lot::RwLock;
use sha2::{Digest, Sha224};
use std::collections::HashMap;
use tracing::{debug, warn};

pub use store::{spawn_usage_flusher, FileUsageStore, UsageStore};

/// 凭证长度（SHA-224 的十六进制表示）
pub const CREDENTIAL_LEN: usize = 56;

/// 1 GiB
pub const GIB: u64 = 1 << 30;

/// 由密码计算客户端需要发送的凭证
pub fn credential_for(password: &str) -> String {
    hex::encode(Sha224::digest(password.as_bytes()))
}

/// 用户记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub credential: String,
    pub username: String,
    /// 配额（字节），0 表示不限
    pub quota: u64,
    /// 累计用量（字节）
    pub usage: u64,
    pub admin: bool,
}

impl UserRecord {
    pub fn new(username: impl Into<String>, credential: impl Into<String>, quota: u64) -> Self {
        Self {
            credential: credential.into(),
            username: username.into(),
            quota,
            usage: 0,
            admin: false,
        }
    }

    /// 是否还在配额之内
    pub fn within_quota(&self) -> bool {
        self.quota == 0 || self.usage < self.quota
    }
}

/// 用户注册表
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl UserRegistry {
    pub fn new(records: impl IntoIterator<Item = UserRecord>) -> Self {
        let users = records
            .into_iter()
            .map(|record| (record.credential.clone(), record))
            .collect();
        Self {
            users: RwLock::new(users),
        }
    }

    /// 从配置构建（配置中的配额单位是 GiB）
    pub fn from_config(users: &[UserConfig]) -> Self {
        Self::new(users.iter().map(|user| UserRecord {
            credential: credential_for(&user.password),
            username: user.username.clone(),
            quota: user.quota.saturating_mul(GIB),
            usage: 0,
            admin: user.admin,
        }))
    }

    /// 恢复持久化的用量，未知凭证会被忽略
    pub fn restore_usage(&self, usage: &HashMap<String, u64>) {
        let mut users = self.users.write();
        for (credential, bytes) in usage {
            match users.get_mut(credential) {
                Some(record) => record.usage = *bytes,
                None => debug!("Ignoring stored usage for unknown credential"),
            }
        }
    }

    /// 认证
    ///
    /// 返回 `(username, allowed)`：未知凭证为 `("", false)`，
    /// 已知凭证但配额用尽为 `(username, false)`
    pub fn authenticate(&self, credential: &str) -> (String, bool) {
        match self.users.read().get(credential) {
            Some(record) => (record.username.clone(), record.within_quota()),
            None => (String::new(), false),
        }
    }

    /// 连接关闭时累加用量，未知用户忽略
    pub fn record_usage(&self, ctx: &RequestContext) {
        let mut users = self.users.write();
        match users.get_mut(&ctx.credential) {
            Some(record) => {
                record.usage = record.usage.saturating_add(ctx.total());
                if !record.within_quota() {
                    warn!(
                        "User '{}' is over quota ({} / {} bytes)",
                        record.username, record.usage, record.quota
                    );
                }
            }
            None => debug!("Usage for unknown user '{}' dropped", ctx.username),
        }
    }

    /// 拨号前的再次检查（尽力而为）：未知凭证视为通过
    pub fn check_usage(&self, credential: &str) -> bool {
        self.users
            .read()
            .get(credential)
            .map(UserRecord::within_quota)
            .unwrap_or(true)
    }

    /// 用量快照（凭证 -> 字节数）
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.users
            .read()
            .values()
            .map(|record| (record.credential.clone(), record.usage))
            .collect()
    }

    pub fn get(&self, credential: &str) -> Option<UserRecord> {
        self.users.read().get(credential).cloned()
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}
