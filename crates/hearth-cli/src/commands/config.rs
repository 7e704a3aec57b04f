//! Configuration management commands.

use hearth_core::Config;

use crate::ConfigAction;

pub fn handle(action: ConfigAction, config: &Config) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Check => {
            let result = config.validate();
            if result.issues.is_empty() {
                println!("Configuration OK ({} servers)", config.mcp.servers.len());
                return Ok(());
            }
            for issue in &result.issues {
                println!("{}", issue);
            }
            config.ensure_valid()?;
        }
    }
    Ok(())
}
