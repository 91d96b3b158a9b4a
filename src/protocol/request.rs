/// 握手与请求头解析
///
/// 解析器只向前读取，不丢弃任何原始字节，失败后调用方可以把整个前缀回放给回落服务
use super::{read_address, read_crlf, CMD_CONNECT, CMD_UDP_ASSOCIATE};
use crate::context::{Network, RequestContext};
use crate::error::{GatewayError, Result};
use crate::registry::{UserRegistry, CREDENTIAL_LEN};
use crate::rules::RuleEngine;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// 读取以 `\n` 结尾的一行（去掉行尾的 `\r`）
///
/// 逐字节读取，避免读过请求头吞掉后续负载
async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::with_capacity(CREDENTIAL_LEN + 2);
    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(line)
}

/// 解析凭证行和请求头
///
/// 依次完成：凭证认证、配额检查、命令与地址解码、CRLF 校验、访问控制规则
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
    registry: &UserRegistry,
    rules: &RuleEngine,
) -> Result<RequestContext> {
    let line = read_line(reader).await?;
    if line.len() < CREDENTIAL_LEN {
        return Err(GatewayError::format(format!(
            "credential line too short: {} bytes",
            line.len()
        )));
    }

    let credential = String::from_utf8_lossy(&line[..CREDENTIAL_LEN]).into_owned();
    let (username, allowed) = registry.authenticate(&credential);
    if username.is_empty() {
        return Err(GatewayError::auth("unknown credential"));
    }
    if !allowed {
        return Err(GatewayError::quota_exceeded(username));
    }

    let command = reader
        .read_u8()
        .await
        .map_err(|e| GatewayError::protocol(format!("failed to read command: {}", e)))?;
    let network = match command {
        CMD_CONNECT => Network::Tcp,
        CMD_UDP_ASSOCIATE => Network::Udp,
        other => {
            return Err(GatewayError::protocol(format!(
                "unknown command 0x{:02x}",
                other
            )))
        }
    };

    let target = read_address(reader).await?;
    read_crlf(reader).await?;

    let ctx = RequestContext::new(username, credential, target, network);
    if !rules.evaluate(&ctx).await {
        return Err(GatewayError::policy_denied(
            ctx.username.clone(),
            ctx.target.to_string(),
        ));
    }

    debug!("Handshake accepted: [{}] {} ({})", ctx.username, ctx.target, ctx.network);
    Ok(ctx)
}
