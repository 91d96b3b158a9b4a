use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::GatewayConfig;

/// 检查配置文件权限（仅Unix系统）
///
/// 配置文件包含用户密码，不应被其他用户读取
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();

    // o+r = 0o004, g+r = 0o040
    if mode & 0o044 != 0 {
        warn!(
            "Config file '{}' is readable by group or others (permissions: {:o}), \
             it contains user passwords. RECOMMENDATION: chmod 600 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str) -> Result<()> {
    Ok(())
}

/// 展开 `~` 并转换为绝对路径
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub details: serde_json::Value,
}

impl CheckResult {
    fn failed(error: String) -> Self {
        Self {
            valid: false,
            warnings: vec![],
            error: Some(error),
            details: serde_json::json!({}),
        }
    }
}

/// 检查配置并汇总结果
pub fn inspect_config(config_path: &str) -> CheckResult {
    let path = Path::new(config_path);
    if !path.exists() {
        return CheckResult::failed(format!("Configuration file not found: {}", config_path));
    }

    let config = match GatewayConfig::load(path) {
        Ok(config) => config,
        Err(e) => return CheckResult::failed(format!("{:#}", e)),
    };

    let server = &config.server;
    let mut warnings = Vec::new();
    let mut details = serde_json::json!({
        "listen": server.listen_addr(),
        "transport": server.transport.to_string(),
        "behind_proxy": server.behind_proxy,
        "reshape": server.reshape,
        "users": config.users.len(),
        "admins": config.users.iter().filter(|u| u.admin).count(),
        "rules": config.rules.len(),
    });

    match (&server.cert_path, &server.key_path) {
        (Some(cert), Some(key)) => {
            details["cert_path"] = serde_json::json!(cert);
            details["key_path"] = serde_json::json!(key);
            for (label, file) in [("Certificate", cert), ("Key", key)] {
                let expanded = shellexpand::tilde(&file.to_string_lossy()).into_owned();
                if !Path::new(&expanded).exists() {
                    warnings.push(format!("{} file not found: {:?}", label, file));
                }
            }
        }
        _ if server.behind_proxy => {
            details["cert_mode"] = serde_json::json!("terminated by proxy");
        }
        _ => {
            details["cert_mode"] = serde_json::json!("auto-generate");
            warnings.push("No certificate configured, a self-signed one will be used".to_string());
        }
    }

    match server.fallback_addr {
        Some(ref addr) => details["fallback_addr"] = serde_json::json!(addr),
        None => warnings.push("No fallback_addr, failed handshakes will be closed".to_string()),
    }

    if let Some(ref usage) = server.usage_file {
        details["usage_file"] = serde_json::json!(usage);
    }

    CheckResult {
        valid: true,
        warnings,
        error: None,
        details,
    }
}

/// 检查配置文件
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let result = inspect_config(config_path);

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_text(config_path, &result);
    }

    match result.error {
        Some(error) => anyhow::bail!(error),
        None => Ok(()),
    }
}

fn print_text(config_path: &str, result: &CheckResult) {
    println!("Checking configuration file: {}\n", config_path);

    if let Some(ref error) = result.error {
        println!("✗ Configuration validation failed!");
        println!("\nError details:");
        println!("{}", error);

        println!("\nCommon issues:");
        println!("  1. Check TOML syntax (brackets, quotes, commas)");
        println!("  2. [server] needs bind_addr and bind_port (1-65535)");
        println!("  3. At least one [[users]] entry with username and password is required");
        println!("  4. Passwords must be unique across users");
        println!("  5. cert_path and key_path must be set together, or both omitted");
        println!("  6. [[rules]] ip/cidr values must be valid, network must be tcp or udp");
        return;
    }

    if let Some(details) = result.details.as_object() {
        for (key, value) in details {
            println!("✓ {}: {}", key, value);
        }
    }
    for warning in &result.warnings {
        println!("⚠ Warning: {}", warning);
    }
    println!("\n✓ Gateway configuration is valid!");
}
