//! `chatforge serve`: wire the engine and start the HTTP intake.

use std::sync::Arc;

use anyhow::{Context, Result};

use super::super::{Cli, init_tracing};
use chatforge::chat::SlackClient;
use chatforge::config::ChatforgeConfig;
use chatforge::domain::SessionRegistry;
use chatforge::engine::{ClaudeCli, DeliveryMode, Dispatcher, ExecutionDriver, RepositorySlots};
use chatforge::hosting::{GitHubClient, is_valid_github_token};
use chatforge::server;

pub async fn cmd_serve(
    cli: &Cli,
    host: Option<String>,
    port: Option<u16>,
    delivery_mode: Option<DeliveryMode>,
) -> Result<()> {
    let (mut config, source) = ChatforgeConfig::load_layered(cli.config.as_deref())?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(mode) = delivery_mode {
        config.slack.delivery_mode = mode;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_tracing(config.logging.format, cli.verbose);

    config.validate()?;
    let (slack_token, github_token) = config.require_secrets()?;
    if !is_valid_github_token(github_token) {
        tracing::warn!("GitHub token has an unrecognized format; API calls may fail");
    }

    let catalog = Arc::new(config.catalog()?);
    tracing::info!(
        config = %source.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "none".to_string()),
        repositories = %catalog.keys().join(","),
        default = %catalog.default_repository().key(),
        delivery = %config.slack.delivery_mode,
        max_concurrent = config.generator.max_concurrent,
        "starting chatforge"
    );

    let chat = Arc::new(SlackClient::new(slack_token));
    let host = match &config.github.api_base {
        Some(base) => GitHubClient::with_api_base(github_token, base)?,
        None => GitHubClient::new(github_token)?,
    };
    let generator = ClaudeCli::new(&config.generator.command)
        .with_extra_args(config.generator.extra_args.clone());
    let driver = ExecutionDriver::new(
        Arc::new(generator),
        Arc::new(RepositorySlots::new(config.generator.max_concurrent)),
        config.driver_settings(),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(SessionRegistry::new()),
        catalog,
        chat,
        Arc::new(host),
        Arc::new(driver),
        config.dispatcher_settings(),
    ));

    server::serve(dispatcher, &config.server.host, config.server.port)
        .await
        .context("chatforge server failed")
}
