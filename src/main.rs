use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use lastdoc::gateway::{self, handlers::AppState};
use lastdoc::Config;

/// Versioned technical-document library with per-version search indexes.
#[derive(Parser, Debug)]
#[command(name = "lastdoc", version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Override server.host
        #[arg(long)]
        host: Option<String>,

        /// Override server.port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration JSON schema
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "lastdoc", &mut std::io::stdout());
            Ok(())
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = Config::load(cli.config.as_deref())?;
                print!("{}", config.to_toml()?);
                Ok(())
            }
            ConfigAction::Schema => {
                println!("{}", Config::json_schema()?);
                Ok(())
            }
        },
        Commands::Serve { host, port } => {
            let mut config = Config::load(cli.config.as_deref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.validate()?;
            serve(config).await
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    lastdoc::logging::init(&config.logging)?;

    let service = Arc::new(lastdoc::open_service(&config).await?);
    let shutdown = CancellationToken::new();

    let indexer = config
        .indexing
        .auto_index
        .then(|| service.start_auto_indexing(shutdown.child_token()));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
        }
        signal.cancel();
    });

    let result = gateway::serve(AppState::new(service), &config.server, shutdown.clone()).await;
    shutdown.cancel();
    if let Some(indexer) = indexer {
        indexer.await.context("auto indexer task failed")?;
    }
    result
}
