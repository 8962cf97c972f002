//! Configuration view and validation commands: `chatforge config`.

use anyhow::Result;

use super::super::{Cli, ConfigCommands};
use chatforge::config::ChatforgeConfig;

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let (config, source) = ChatforgeConfig::load_layered(cli.config.as_deref())?;

    match command {
        None | Some(ConfigCommands::Show) => {
            match &source {
                Some(path) => println!("# Config file: {}", path.display()),
                None => println!("# Config file: none (defaults and environment)"),
            }
            println!();
            print!("{}", config.redacted().to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            config.validate()?;
            let catalog = config.catalog()?;
            println!(
                "Configuration is valid: {} repositories, default {}",
                catalog.len(),
                catalog.default_repository().key()
            );
            if config.slack.bot_token.is_none() {
                println!("warning: SLACK_BOT_TOKEN is not set (required by serve)");
            }
            if config.github.token.is_none() {
                println!("warning: GITHUB_TOKEN is not set (required by serve)");
            }
        }
    }
    Ok(())
}
