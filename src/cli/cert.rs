use anyhow::Result;
use std::path::Path;

use super::config::expand_path;
use crate::tls;

/// 生成自签名证书
pub fn generate_certificate(
    cert_out: &str,
    key_out: &str,
    common_name: &str,
    alt_names: &[String],
) -> Result<()> {
    let cert_out = expand_path(cert_out)?;
    let key_out = expand_path(key_out)?;

    tls::generate_self_signed_cert(
        common_name,
        alt_names,
        Path::new(&cert_out),
        Path::new(&key_out),
    )?;

    println!("Generated self-signed certificate: {}", cert_out);
    println!("Generated private key: {}", key_out);
    println!("Point cert_path and key_path in the [server] section at these files.");

    Ok(())
}
