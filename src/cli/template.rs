use anyhow::{Context, Result};

/// 服务器配置模板
pub const SERVER_TEMPLATE: &str = include_str!("../../templates/server-template.toml");

/// 生成配置模板
pub fn generate_config_template(output: Option<&str>) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, SERVER_TEMPLATE)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated server configuration template: {}", path);
    } else {
        println!("{}", SERVER_TEMPLATE);
    }

    Ok(())
}
