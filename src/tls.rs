use crate::config::ServerConfig;
use anyhow::{Context, Result};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// 自动生成证书时使用的默认名称
pub const DEFAULT_CERT_NAME: &str = "localhost";

fn alpn_protocols(alpn: &[String]) -> Vec<Vec<u8>> {
    alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
}

/// 加载证书链
pub fn load_certs(cert_path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let cert_file = File::open(cert_path)
        .with_context(|| format!("Failed to open cert file: {:?}", cert_path))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificate found in {:?}", cert_path);
    }
    Ok(certs)
}

/// 加载私钥
pub fn load_private_key(key_path: &Path) -> Result<PrivateKeyDer<'static>> {
    let key_file =
        File::open(key_path).with_context(|| format!("Failed to open key file: {:?}", key_path))?;
    let mut key_reader = BufReader::new(key_file);

    rustls_pemfile::private_key(&mut key_reader)
        .context("Failed to parse private key")?
        .context("No private key found")
}

/// 由证书链和私钥构建服务器 TLS 配置
pub fn server_config_from_parts(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn: &[String],
) -> Result<Arc<rustls::ServerConfig>> {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to create server config")?;

    // 设置 ALPN 协议
    config.alpn_protocols = alpn_protocols(alpn);

    Ok(Arc::new(config))
}

/// 从 PEM 文件加载服务器 TLS 配置
pub fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
    alpn: &[String],
) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    server_config_from_parts(certs, key, alpn)
}

/// 生成内存中的自签名证书
pub fn self_signed_cert(
    names: &[String],
) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let names = if names.is_empty() {
        vec![DEFAULT_CERT_NAME.to_string()]
    } else {
        names.to_vec()
    };
    let cert =
        generate_simple_self_signed(names).context("Failed to generate self-signed certificate")?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.signing_key.serialize_der()));
    Ok((cert.cert.der().clone(), key))
}

/// 根据网关配置创建 TLS 接收器
///
/// 运行在反向代理后时返回 `None`；未配置证书时使用临时自签名证书
pub fn build_acceptor(config: &ServerConfig) -> Result<Option<TlsAcceptor>> {
    if config.behind_proxy {
        info!("Running behind a proxy, TLS is terminated upstream");
        return Ok(None);
    }

    let tls_config = match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_path = expand_path(cert_path);
            let key_path = expand_path(key_path);
            info!("Loading TLS certificate from {:?}", cert_path);
            load_server_config(Path::new(&cert_path), Path::new(&key_path), &config.alpn)?
        }
        _ => {
            warn!("No certificate configured, using an ephemeral self-signed certificate");
            let (cert, key) = self_signed_cert(&[DEFAULT_CERT_NAME.to_string()])?;
            server_config_from_parts(vec![cert], key, &config.alpn)?
        }
    };

    Ok(Some(TlsAcceptor::from(tls_config)))
}

fn expand_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    shellexpand::tilde(&raw).into_owned()
}

/// 生成自签名证书和私钥并写入指定路径
pub fn generate_self_signed_cert(
    common_name: &str,
    alt_names: &[String],
    cert_out: &Path,
    key_out: &Path,
) -> Result<()> {
    // rcgen 至少需要一个 SAN；确保包含 CN
    let mut names: Vec<String> = if alt_names.is_empty() {
        vec![common_name.to_string()]
    } else {
        alt_names.to_vec()
    };

    if !names.iter().any(|n| n == common_name) {
        names.push(common_name.to_string());
    }

    let cert =
        generate_simple_self_signed(names).context("Failed to generate self-signed certificate")?;
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();

    std::fs::write(cert_out, cert_pem)
        .with_context(|| format!("Failed to write certificate to {:?}", cert_out))?;
    std::fs::write(key_out, key_pem)
        .with_context(|| format!("Failed to write private key to {:?}", key_out))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tls-gate-{}-{}", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_generate_and_load_roundtrip() {
        let cert_path = temp_path("cert.pem");
        let key_path = temp_path("key.pem");
        generate_self_signed_cert(
            "gate.example",
            &["www.gate.example".to_string()],
            &cert_path,
            &key_path,
        )
        .unwrap();

        let config = load_server_config(&cert_path, &key_path, &["h2".to_string()]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);

        let _ = std::fs::remove_file(&cert_path);
        let _ = std::fs::remove_file(&key_path);
    }

    #[test]
    fn test_missing_cert_file() {
        let result = load_server_config(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
            &[],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_build_acceptor_modes() {
        let mut config = ServerConfig::builder()
            .bind_addr("127.0.0.1")
            .bind_port(8443)
            .build()
            .unwrap();
        assert!(build_acceptor(&config).unwrap().is_some());

        config.behind_proxy = true;
        assert!(build_acceptor(&config).unwrap().is_none());
    }
}
