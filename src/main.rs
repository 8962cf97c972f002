use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use chatforge::config::LogFormat;
use chatforge::engine::DeliveryMode;

mod cmd;

#[derive(Parser)]
#[command(name = "chatforge")]
#[command(version, about = "Run a code generator per chat thread and stream progress back")]
pub struct Cli {
    /// Path to the config file. Defaults to ./chatforge.toml, then the user config directory.
    #[arg(short, long, global = true, env = "CHATFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format (overrides the config file and LOG_FORMAT)
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP event intake
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// How progress is delivered: edit or post
        #[arg(long)]
        delivery_mode: Option<DeliveryMode>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show how a message would be classified
    Classify {
        /// Message text, as typed in the thread
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the resolved configuration with secrets redacted
    Show,
    /// Validate configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve {
            host,
            port,
            delivery_mode,
        } => {
            cmd::cmd_serve(&cli, host.clone(), *port, *delivery_mode).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
        Commands::Classify { text } => cmd::cmd_classify(&text.join(" ")),
    }

    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the defaults.
pub fn init_tracing(format: LogFormat, verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
}
