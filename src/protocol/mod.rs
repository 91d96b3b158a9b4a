/// 隧道协议编解码
///
/// 请求头格式（解密之后）：
///
/// ```text
/// <credential:56><CR><LF>
/// <command:1><atype:1><addr><port:2 BE><CR><LF>
/// <payload ...>
/// ```
///
/// 地址类型：0x01 IPv4（4 字节），0x03 域名（1 字节长度 + N 字节），0x04 IPv6（16 字节）
pub mod request;
pub mod udp;

use crate::error::{GatewayError, Result};
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

pub use request::read_request;
pub use udp::{encode_envelope, read_envelope, Envelope};

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const CRLF: &[u8; 2] = b"\r\n";

/// 目标地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP 地址 + 端口
    Ip(SocketAddr),
    /// 域名 + 端口
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// 主机部分（IP 字符串或域名）
    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Address::Ip(addr) => Some(*addr),
            Address::Domain(..) => None,
        }
    }

    /// 地址类型字节
    pub fn atype(&self) -> u8 {
        match self {
            Address::Ip(SocketAddr::V4(_)) => ATYP_IPV4,
            Address::Ip(SocketAddr::V6(_)) => ATYP_IPV6,
            Address::Domain(..) => ATYP_DOMAIN,
        }
    }

    /// 解析为第一个可用的套接字地址
    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        match self {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(domain, port) => tokio::net::lookup_host((domain.as_str(), *port))
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no address found for {}", domain),
                    )
                }),
        }
    }

    /// 编码为 `atype | addr | port`
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.atype());
        match self {
            Address::Ip(SocketAddr::V4(addr)) => buf.put_slice(&addr.ip().octets()),
            Address::Ip(SocketAddr::V6(addr)) => buf.put_slice(&addr.ip().octets()),
            Address::Domain(domain, _) => {
                let len = u8::try_from(domain.len()).map_err(|_| {
                    GatewayError::protocol(format!("domain too long: {} bytes", domain.len()))
                })?;
                buf.put_u8(len);
                buf.put_slice(domain.as_bytes());
            }
        }
        buf.put_u16(self.port());
        Ok(())
    }

    /// 编码后的长度
    pub fn encoded_len(&self) -> usize {
        let addr_len = match self {
            Address::Ip(SocketAddr::V4(_)) => 4,
            Address::Ip(SocketAddr::V6(_)) => 16,
            Address::Domain(domain, _) => 1 + domain.len(),
        };
        1 + addr_len + 2
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        // IPv4 映射地址按 IPv4 编码
        match addr {
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => Address::Ip(SocketAddr::new(IpAddr::V4(v4), v6.port())),
                None => Address::Ip(addr),
            },
            SocketAddr::V4(_) => Address::Ip(addr),
        }
    }
}

fn truncated(what: &str, err: io::Error) -> GatewayError {
    GatewayError::protocol(format!("failed to read {}: {}", what, err))
}

/// 读取 `atype | addr | port`
pub async fn read_address<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Address> {
    let atype = reader
        .read_u8()
        .await
        .map_err(|e| truncated("address type", e))?;

    match atype {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader
                .read_exact(&mut octets)
                .await
                .map_err(|e| truncated("IPv4 address", e))?;
            let port = read_port(reader).await?;
            Ok(Address::Ip(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(octets)),
                port,
            )))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader
                .read_exact(&mut octets)
                .await
                .map_err(|e| truncated("IPv6 address", e))?;
            let port = read_port(reader).await?;
            Ok(Address::Ip(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                port,
            )))
        }
        ATYP_DOMAIN => {
            let len = reader
                .read_u8()
                .await
                .map_err(|e| truncated("domain length", e))? as usize;
            let mut raw = vec![0u8; len];
            reader
                .read_exact(&mut raw)
                .await
                .map_err(|e| truncated("domain", e))?;
            let domain = String::from_utf8(raw)
                .map_err(|_| GatewayError::protocol("domain is not valid UTF-8"))?;
            let port = read_port(reader).await?;
            Ok(Address::Domain(domain, port))
        }
        other => Err(GatewayError::protocol(format!(
            "unknown address type 0x{:02x}",
            other
        ))),
    }
}

async fn read_port<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u16> {
    reader.read_u16().await.map_err(|e| truncated("port", e))
}

/// 读取并校验 CRLF
pub async fn read_crlf<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    let mut crlf = [0u8; 2];
    reader
        .read_exact(&mut crlf)
        .await
        .map_err(|e| truncated("CRLF", e))?;
    if &crlf != CRLF {
        return Err(GatewayError::protocol(format!(
            "expected CRLF, got {:02x?}",
            crlf
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_ipv4_address() {
        let data: &[u8] = &[ATYP_IPV4, 1, 2, 3, 4, 0x00, 0x50];
        let mut reader = data;
        let addr = read_address(&mut reader).await.unwrap();
        assert_eq!(addr, Address::Ip("1.2.3.4:80".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_read_domain_address() {
        let mut data = vec![ATYP_DOMAIN, 11];
        data.extend_from_slice(b"example.com");
        data.extend_from_slice(&443u16.to_be_bytes());
        let mut reader = &data[..];
        let addr = read_address(&mut reader).await.unwrap();
        assert_eq!(addr, Address::Domain("example.com".to_string(), 443));
        assert_eq!(addr.to_string(), "example.com:443");
    }

    #[tokio::test]
    async fn test_read_ipv6_address() {
        let mut data = vec![ATYP_IPV6];
        data.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        data.extend_from_slice(&53u16.to_be_bytes());
        let mut reader = &data[..];
        let addr = read_address(&mut reader).await.unwrap();
        assert_eq!(addr.to_string(), "[::1]:53");
        assert_eq!(addr.atype(), ATYP_IPV6);
    }

    #[tokio::test]
    async fn test_unknown_atype_rejected() {
        let data: &[u8] = &[0x02, 1, 2, 3, 4, 0, 80];
        let mut reader = data;
        let err = read_address(&mut reader).await.unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_truncated_address_rejected() {
        let data: &[u8] = &[ATYP_DOMAIN, 20, b'a', b'b'];
        let mut reader = data;
        let err = read_address(&mut reader).await.unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_invalid_utf8_domain_rejected() {
        let data: &[u8] = &[ATYP_DOMAIN, 2, 0xff, 0xfe, 0, 80];
        let mut reader = data;
        assert!(read_address(&mut reader).await.is_err());
    }

    #[test]
    fn test_write_address_layout() {
        let mut buf = BytesMut::new();
        let addr = Address::Domain("a.io".to_string(), 8080);
        addr.write_to(&mut buf).unwrap();
        assert_eq!(&buf[..], &[ATYP_DOMAIN, 4, b'a', b'.', b'i', b'o', 0x1f, 0x90]);
        assert_eq!(addr.encoded_len(), buf.len());
    }

    #[test]
    fn test_domain_too_long() {
        let mut buf = BytesMut::new();
        let addr = Address::Domain("x".repeat(256), 80);
        assert!(addr.write_to(&mut buf).is_err());
    }

    #[test]
    fn test_mapped_ipv4_is_unwrapped() {
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:53".parse().unwrap();
        let addr = Address::from(mapped);
        assert_eq!(addr.atype(), ATYP_IPV4);
        assert_eq!(addr.to_string(), "10.0.0.1:53");
    }

    #[tokio::test]
    async fn test_crlf_check() {
        let mut ok: &[u8] = b"\r\n";
        assert!(read_crlf(&mut ok).await.is_ok());
        let mut bad: &[u8] = b"\n\r";
        assert!(read_crlf(&mut bad).await.is_err());
    }
}
