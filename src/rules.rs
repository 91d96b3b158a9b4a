/// 访问控制规则
///
/// 规则按顺序匹配，第一个命中的规则决定放行或拒绝，没有命中时默认放行。
/// 地址类谓词（IP、CIDR、`private`）需要把目标主机解析为 IP，
/// 每次评估最多解析一次，且只在真正用到时才解析
use crate::config::RuleConfig;
use crate::context::{Network, RequestContext};
use crate::error::{GatewayError, Result};
use crate::protocol::Address;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::debug;

/// 代表所有私有/保留地址的特殊域名谓词
pub const PRIVATE_TOKEN: &str = "private";

/// 主机名解析器
#[async_trait]
pub trait Resolver: Send + Sync {
    /// 解析主机名，失败时返回空列表
    async fn lookup(&self, host: &str) -> Vec<IpAddr>;
}

/// 使用系统解析器
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup(&self, host: &str) -> Vec<IpAddr> {
        match tokio::net::lookup_host((host, 0)).await {
            Ok(addrs) => addrs.map(|addr| addr.ip()).collect(),
            Err(e) => {
                debug!("Failed to resolve {}: {}", host, e);
                Vec::new()
            }
        }
    }
}

/// 域名谓词
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPredicate {
    /// 目标解析后的任一地址是私有/保留地址
    Private,
    /// 主机字符串包含该子串
    Contains(String),
}

/// 单条规则
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub network: Option<Network>,
    pub username: Option<String>,
    pub port: Option<u16>,
    pub ip: Option<IpAddr>,
    pub cidr: Option<IpNetwork>,
    pub domain: Option<DomainPredicate>,
    pub allow: bool,
}

impl Rule {
    fn with_outcome(allow: bool) -> Self {
        Self {
            network: None,
            username: None,
            port: None,
            ip: None,
            cidr: None,
            domain: None,
            allow,
        }
    }

    /// 匹配所有请求的放行规则
    pub fn allow() -> Self {
        Self::with_outcome(true)
    }

    /// 匹配所有请求的拒绝规则
    pub fn deny() -> Self {
        Self::with_outcome(false)
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_cidr(mut self, cidr: IpNetwork) -> Self {
        self.cidr = Some(cidr);
        self
    }

    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = Some(if domain == PRIVATE_TOKEN {
            DomainPredicate::Private
        } else {
            DomainPredicate::Contains(domain.to_string())
        });
        self
    }

    /// 是否需要解析目标地址
    pub fn needs_addresses(&self) -> bool {
        self.ip.is_some() || self.cidr.is_some() || self.domain == Some(DomainPredicate::Private)
    }

    /// 只检查不需要解析的谓词
    fn matches_request(&self, ctx: &RequestContext) -> bool {
        if let Some(network) = self.network {
            if network != ctx.network {
                return false;
            }
        }
        if let Some(username) = &self.username {
            if username != &ctx.username {
                return false;
            }
        }
        if let Some(port) = self.port {
            if port != ctx.port() {
                return false;
            }
        }
        if let Some(DomainPredicate::Contains(needle)) = &self.domain {
            if !ctx.host().contains(needle.as_str()) {
                return false;
            }
        }
        true
    }

    /// 检查地址类谓词，任一地址满足即可
    fn matches_addresses(&self, addrs: &[IpAddr]) -> bool {
        if let Some(ip) = self.ip {
            let ip = canonical(ip);
            if !addrs.iter().any(|addr| canonical(*addr) == ip) {
                return false;
            }
        }
        if let Some(cidr) = self.cidr {
            if !addrs.iter().any(|addr| cidr.contains(canonical(*addr))) {
                return false;
            }
        }
        if self.domain == Some(DomainPredicate::Private)
            && !addrs.iter().any(|addr| is_private_ip(*addr))
        {
            return false;
        }
        true
    }

    /// 使用已解析的地址列表判断是否命中
    pub fn matches(&self, ctx: &RequestContext, addrs: &[IpAddr]) -> bool {
        self.matches_request(ctx) && (!self.needs_addresses() || self.matches_addresses(addrs))
    }
}

impl TryFrom<&RuleConfig> for Rule {
    type Error = GatewayError;

    fn try_from(config: &RuleConfig) -> Result<Self> {
        let mut rule = Rule::with_outcome(config.allow);

        if let Some(network) = config.network.as_deref().filter(|s| !s.is_empty()) {
            rule.network = Some(network.parse().map_err(GatewayError::config)?);
        }
        if let Some(username) = config.username.as_deref().filter(|s| !s.is_empty()) {
            rule.username = Some(username.to_string());
        }
        rule.port = config.port;
        if let Some(ip) = config.ip.as_deref().filter(|s| !s.is_empty()) {
            rule.ip = Some(ip.parse().map_err(|_| {
                GatewayError::config(format!("invalid IP address in rule: {}", ip))
            })?);
        }
        if let Some(cidr) = config.cidr.as_deref().filter(|s| !s.is_empty()) {
            rule.cidr = Some(cidr.parse().map_err(|e| {
                GatewayError::config(format!("invalid CIDR in rule '{}': {}", cidr, e))
            })?);
        }
        if let Some(domain) = config.domain.as_deref().filter(|s| !s.is_empty()) {
            rule = rule.with_domain(domain);
        }
        Ok(rule)
    }
}

/// IPv4 映射的 IPv6 地址按 IPv4 处理
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_private()            // 10/8, 172.16/12, 192.168/16
        || ip.is_loopback()    // 127/8
        || ip.is_link_local()  // 169.254/16
        || ip.is_multicast()
        || ip.is_unspecified()
        || a == 0              // 0/8
        || a >= 240            // 240/4，包含广播地址
        || (a == 100 && (b & 0xc0) == 64) // 100.64/10 运营商级 NAT
        || (a == 198 && (b & 0xfe) == 18) // 198.18/15 基准测试
        || (a == 192 && b == 0 && c == 0) // 192.0.0/24 协议分配
        || (a == 192 && b == 0 && c == 2) // 文档地址
        || (a == 198 && b == 51 && c == 100)
        || (a == 203 && b == 0 && c == 113)
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || (first & 0xfe00) == 0xfc00 // fc00::/7
        || (first & 0xff00) == 0xfe00 // fe00::/8，包含 fe80::/10
}

/// 是否为私有、保留或非全局单播地址
pub fn is_private_ip(ip: IpAddr) -> bool {
    match canonical(ip) {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

/// 规则引擎
#[derive(Clone)]
pub struct RuleEngine {
    rules: Arc<Vec<Rule>>,
    resolver: Arc<dyn Resolver>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self::with_resolver(rules, Arc::new(SystemResolver))
    }

    pub fn with_resolver(rules: Vec<Rule>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            rules: Arc::new(rules),
            resolver,
        }
    }

    /// 从配置构建
    pub fn from_config(configs: &[RuleConfig]) -> Result<Self> {
        let rules = configs
            .iter()
            .map(Rule::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    async fn resolve(&self, target: &Address) -> Vec<IpAddr> {
        match target {
            Address::Ip(addr) => vec![addr.ip()],
            Address::Domain(host, _) => match host.parse::<IpAddr>() {
                Ok(ip) => vec![ip],
                Err(_) => self.resolver.lookup(host).await,
            },
        }
    }

    /// 单条规则是否命中（按需解析目标）
    pub async fn match_rule(&self, ctx: &RequestContext, rule: &Rule) -> bool {
        if !rule.matches_request(ctx) {
            return false;
        }
        if !rule.needs_addresses() {
            return true;
        }
        let addrs = self.resolve(&ctx.target).await;
        rule.matches_addresses(&addrs)
    }

    /// 评估请求，返回是否放行
    pub async fn evaluate(&self, ctx: &RequestContext) -> bool {
        // UDP 关联请求常以端口 0 占位，直接放行
        if ctx.network == Network::Udp && ctx.port() == 0 {
            return true;
        }

        let mut resolved: Option<Vec<IpAddr>> = None;
        for (index, rule) in self.rules.iter().enumerate() {
            if !rule.matches_request(ctx) {
                continue;
            }
            if rule.needs_addresses() {
                if resolved.is_none() {
                    resolved = Some(self.resolve(&ctx.target).await);
                }
                if !rule.matches_addresses(resolved.as_deref().unwrap_or_default()) {
                    continue;
                }
            }
            debug!(
                "Rule #{} matched [{}] {}: {}",
                index,
                ctx.username,
                ctx.target,
                if rule.allow { "allow" } else { "deny" }
            );
            return rule.allow;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 固定映射的解析器，同时记录调用次数
    #[derive(Default)]
    struct StaticResolver {
        hosts: HashMap<String, Vec<IpAddr>>,
        calls: AtomicUsize,
    }

    impl StaticResolver {
        fn with(host: &str, ips: &[&str]) -> Self {
            let mut hosts = HashMap::new();
            hosts.insert(
                host.to_string(),
                ips.iter().map(|ip| ip.parse().unwrap()).collect(),
            );
            Self {
                hosts,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Resolver for StaticResolver {
        async fn lookup(&self, host: &str) -> Vec<IpAddr> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.hosts.get(host).cloned().unwrap_or_default()
        }
    }

    fn ctx(host: &str, port: u16, network: Network) -> RequestContext {
        let target = match host.parse::<IpAddr>() {
            Ok(ip) => Address::Ip((ip, port).into()),
            Err(_) => Address::Domain(host.to_string(), port),
        };
        RequestContext::new("alice", "c".repeat(56), target, network)
    }

    #[test]
    fn test_private_ranges() {
        for ip in [
            "10.1.2.3",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.5",
            "127.0.0.1",
            "169.254.1.1",
            "0.1.2.3",
            "255.255.255.255",
            "224.0.0.1",
            "::1",
            "::",
            "fc00::1",
            "fd12::1",
            "fe80::1",
            "ff02::1",
            "::ffff:192.168.0.1",
        ] {
            assert!(is_private_ip(ip.parse().unwrap()), "{} should be private", ip);
        }
        for ip in [
            "100.64.0.1",
            "100.127.255.254",
            "198.18.0.1",
            "198.19.255.1",
            "192.0.0.8",
            "192.0.2.1",
            "198.51.100.7",
            "203.0.113.9",
            "240.0.0.1",
            "::ffff:100.64.1.1",
        ] {
            assert!(is_private_ip(ip.parse().unwrap()), "{} should be reserved", ip);
        }
        for ip in [
            "93.184.216.34",
            "8.8.8.8",
            "172.32.0.1",
            "100.128.0.1",
            "198.20.0.1",
            "192.0.1.1",
            "2606:4700::1111",
        ] {
            assert!(!is_private_ip(ip.parse().unwrap()), "{} should be public", ip);
        }
    }

    #[tokio::test]
    async fn test_no_rules_allows() {
        let engine = RuleEngine::default();
        assert!(engine.evaluate(&ctx("example.com", 80, Network::Tcp)).await);
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let engine = RuleEngine::new(vec![
            Rule::allow().with_port(22).with_username("alice"),
            Rule::deny().with_port(22),
        ]);
        assert!(engine.evaluate(&ctx("1.1.1.1", 22, Network::Tcp)).await);

        let mut bob = ctx("1.1.1.1", 22, Network::Tcp);
        bob.username = "bob".to_string();
        assert!(!engine.evaluate(&bob).await);
    }

    #[tokio::test]
    async fn test_network_restriction() {
        let engine = RuleEngine::new(vec![Rule::deny().with_network(Network::Udp)]);
        assert!(engine.evaluate(&ctx("1.1.1.1", 53, Network::Tcp)).await);
        assert!(!engine.evaluate(&ctx("1.1.1.1", 53, Network::Udp)).await);

        // 不限制网络的规则同时匹配 TCP 和 UDP
        let engine = RuleEngine::new(vec![Rule::deny().with_port(53)]);
        assert!(!engine.evaluate(&ctx("1.1.1.1", 53, Network::Tcp)).await);
        assert!(!engine.evaluate(&ctx("1.1.1.1", 53, Network::Udp)).await);
    }

    #[tokio::test]
    async fn test_udp_port_zero_always_allowed() {
        let engine = RuleEngine::new(vec![Rule::deny()]);
        assert!(engine.evaluate(&ctx("10.0.0.1", 0, Network::Udp)).await);
        assert!(!engine.evaluate(&ctx("10.0.0.1", 0, Network::Tcp)).await);
    }

    #[tokio::test]
    async fn test_private_via_resolver() {
        let mut hosts = HashMap::new();
        hosts.insert(
            "intranet.corp".to_string(),
            vec!["192.168.1.5".parse().unwrap()],
        );
        hosts.insert(
            "example.org".to_string(),
            vec!["93.184.216.34".parse().unwrap()],
        );
        let resolver = Arc::new(StaticResolver {
            hosts,
            calls: AtomicUsize::new(0),
        });
        let engine = RuleEngine::with_resolver(
            vec![Rule::deny().with_domain(PRIVATE_TOKEN)],
            resolver.clone(),
        );

        assert!(!engine.evaluate(&ctx("intranet.corp", 80, Network::Tcp)).await);
        assert!(engine.evaluate(&ctx("example.org", 80, Network::Tcp)).await);
        // 解析失败时没有地址，不命中
        assert!(engine.evaluate(&ctx("unknown.invalid", 80, Network::Tcp)).await);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_literal_ip_skips_resolver() {
        let resolver = Arc::new(StaticResolver::default());
        let engine = RuleEngine::with_resolver(
            vec![Rule::deny().with_domain(PRIVATE_TOKEN)],
            resolver.clone(),
        );
        assert!(!engine.evaluate(&ctx("10.0.0.8", 443, Network::Tcp)).await);
        assert!(engine.evaluate(&ctx("8.8.8.8", 443, Network::Tcp)).await);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolution_happens_once() {
        let resolver = Arc::new(StaticResolver::with("multi.test", &["1.2.3.4", "5.6.7.8"]));
        let engine = RuleEngine::with_resolver(
            vec![
                Rule::deny().with_ip("9.9.9.9".parse().unwrap()),
                Rule::deny().with_cidr("10.0.0.0/8".parse().unwrap()),
                Rule::deny().with_cidr("5.6.0.0/16".parse().unwrap()),
            ],
            resolver.clone(),
        );
        assert!(!engine.evaluate(&ctx("multi.test", 80, Network::Tcp)).await);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_resolution_without_address_rules() {
        let resolver = Arc::new(StaticResolver::default());
        let engine = RuleEngine::with_resolver(
            vec![Rule::deny().with_domain("ads."), Rule::deny().with_port(25)],
            resolver.clone(),
        );
        assert!(!engine.evaluate(&ctx("ads.tracker.com", 443, Network::Tcp)).await);
        assert!(engine.evaluate(&ctx("news.com", 443, Network::Tcp)).await);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_literal_ip_rule() {
        let engine = RuleEngine::new(vec![Rule::deny().with_ip("1.1.1.1".parse().unwrap())]);
        assert!(!engine.evaluate(&ctx("1.1.1.1", 80, Network::Tcp)).await);
        assert!(engine.evaluate(&ctx("1.0.0.1", 80, Network::Tcp)).await);
    }

    #[tokio::test]
    async fn test_match_rule_single() {
        let engine = RuleEngine::default();
        let rule = Rule::allow().with_cidr("192.168.0.0/16".parse().unwrap());
        assert!(engine.match_rule(&ctx("192.168.3.3", 1, Network::Tcp), &rule).await);
        assert!(!engine.match_rule(&ctx("10.3.3.3", 1, Network::Tcp), &rule).await);
    }

    #[test]
    fn test_rule_from_config() {
        let config = RuleConfig {
            network: Some("udp".to_string()),
            username: Some("alice".to_string()),
            domain: Some("private".to_string()),
            ip: None,
            cidr: Some("10.0.0.0/8".to_string()),
            port: Some(53),
            allow: false,
        };
        let rule = Rule::try_from(&config).unwrap();
        assert_eq!(rule.network, Some(Network::Udp));
        assert_eq!(rule.domain, Some(DomainPredicate::Private));
        assert!(rule.needs_addresses());

        let bad = RuleConfig {
            cidr: Some("10.0.0.0/99".to_string()),
            ..config.clone()
        };
        assert!(Rule::try_from(&bad).is_err());

        let bad = RuleConfig {
            network: Some("sctp".to_string()),
            ..config
        };
        assert!(Rule::try_from(&bad).is_err());
    }
}
