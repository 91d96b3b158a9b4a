use anyhow::Result;
use tracing::info;

use crate::config::GatewayConfig;
use crate::registry::credential_for;
use crate::server;

use super::config::{check_config, check_config_file_permissions, expand_path};
use super::{cert, template};

/// 执行 CLI 命令
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            cert::generate_certificate(cert_out, key_out, common_name, alt_names)?;
        }
        Commands::Credential { password } => {
            println!("{}", credential_for(password));
        }
        Commands::Server { config } => {
            run_server(config).await?;
        }
    }

    Ok(())
}

/// 运行网关
async fn run_server(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;

    // 检查配置文件权限
    check_config_file_permissions(&config_path)?;

    info!("Loading gateway configuration from: {}", config_path);
    let gateway_config = GatewayConfig::load(&config_path)?;

    server::run_server(gateway_config).await
}
