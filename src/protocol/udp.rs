/// UDP 数据报封装
///
/// 每个数据报在隧道流中编码为：
///
/// ```text
/// <atype:1><addr><port:2 BE><length:2 BE><CR><LF><payload>
/// ```
use super::{read_address, read_crlf, Address, CRLF};
use crate::error::{GatewayError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// 单个数据报的最大负载
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// 解码后的数据报
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub target: Address,
    pub payload: Bytes,
}

/// 编码数据报
pub fn encode_envelope(target: &Address, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_PAYLOAD {
        return Err(GatewayError::protocol(format!(
            "UDP payload too large: {} bytes",
            payload.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(target.encoded_len() + 4 + payload.len());
    target.write_to(&mut buf)?;
    buf.put_u16(payload.len() as u16);
    buf.put_slice(CRLF);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// 从隧道流中读取一个数据报
pub async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope> {
    let target = read_address(reader).await?;
    let length = reader
        .read_u16()
        .await
        .map_err(|e| GatewayError::protocol(format!("failed to read UDP length: {}", e)))?
        as usize;
    read_crlf(reader).await?;

    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| GatewayError::protocol(format!("truncated UDP payload: {}", e)))?;

    Ok(Envelope {
        target,
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ATYP_DOMAIN, ATYP_IPV4};

    #[test]
    fn test_encode_ipv4_envelope() {
        let target = Address::Ip("8.8.8.8:53".parse().unwrap());
        let encoded = encode_envelope(&target, b"hi").unwrap();
        assert_eq!(
            &encoded[..],
            &[ATYP_IPV4, 8, 8, 8, 8, 0, 53, 0, 2, b'\r', b'\n', b'h', b'i']
        );
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let target = Address::Ip("8.8.8.8:53".parse().unwrap());
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert!(encode_envelope(&target, &payload).is_err());
        assert!(encode_envelope(&target, &payload[..MAX_PAYLOAD]).is_ok());
    }

    #[tokio::test]
    async fn test_read_consecutive_envelopes() {
        let first = encode_envelope(&Address::Domain("a.com".into(), 53), b"query").unwrap();
        let second = encode_envelope(&Address::Ip("[::1]:9".parse().unwrap()), b"").unwrap();
        let mut stream = first.to_vec();
        stream.extend_from_slice(&second);
        let mut reader = &stream[..];

        let env = read_envelope(&mut reader).await.unwrap();
        assert_eq!(env.target, Address::Domain("a.com".into(), 53));
        assert_eq!(&env.payload[..], b"query");

        let env = read_envelope(&mut reader).await.unwrap();
        assert_eq!(env.target.port(), 9);
        assert!(env.payload.is_empty());
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_boundary_payload_lengths() {
        let targets = [
            Address::Ip("10.0.0.1:53".parse().unwrap()),
            Address::Ip("[2001:db8::1]:443".parse().unwrap()),
            Address::Domain("dns.example".into(), 853),
        ];
        for target in targets {
            for len in [0, MAX_PAYLOAD] {
                let payload: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
                let encoded = encode_envelope(&target, &payload).unwrap();
                let mut reader = &encoded[..];
                let env = read_envelope(&mut reader).await.unwrap();
                assert_eq!(env.target, target);
                assert_eq!(&env.payload[..], &payload[..]);
                assert!(reader.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn test_bad_crlf_rejected() {
        let data: &[u8] = &[ATYP_DOMAIN, 1, b'x', 0, 53, 0, 1, b'X', b'X', b'!'];
        let mut reader = data;
        assert!(read_envelope(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_payload_rejected() {
        let data: &[u8] = &[ATYP_IPV4, 1, 1, 1, 1, 0, 53, 0, 10, b'\r', b'\n', 1, 2];
        let mut reader = data;
        let err = read_envelope(&mut reader).await.unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }
}
