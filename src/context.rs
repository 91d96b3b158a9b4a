/// 单个隧道请求的上下文
use crate::protocol::Address;
use std::fmt;
use std::net::SocketAddr;

/// 请求的网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            other => Err(format!("unknown network '{}', expected tcp or udp", other)),
        }
    }
}

/// 请求上下文
///
/// 由握手解析器填充，随后在转发过程中累计字节数，连接关闭时计入用户用量
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub username: String,
    /// 56 字符小写十六进制凭证
    pub credential: String,
    pub target: Address,
    pub network: Network,
    /// 客户端 -> 目标
    pub sent: u64,
    /// 目标 -> 客户端
    pub received: u64,
}

impl RequestContext {
    pub fn new(
        username: impl Into<String>,
        credential: impl Into<String>,
        target: Address,
        network: Network,
    ) -> Self {
        Self {
            username: username.into(),
            credential: credential.into(),
            target,
            network,
            sent: 0,
            received: 0,
        }
    }

    /// 目标主机（IP 字符串或域名）
    pub fn host(&self) -> String {
        self.target.host()
    }

    pub fn port(&self) -> u16 {
        self.target.port()
    }

    /// 总流量
    pub fn total(&self) -> u64 {
        self.sent + self.received
    }

    /// 日志用的单行描述
    pub fn describe(&self, peer: SocketAddr) -> String {
        format!(
            "[{}] {} -> {} ({})",
            self.username, peer, self.target, self.network
        )
    }
}
