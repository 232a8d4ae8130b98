//! `devnet-signald`: the signaling server binary

use clap::{Parser, Subcommand};
use devnet_signaling::{ServerConfig, SignalingServer, StaticCredentials, hash_secret};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "devnet-signald")]
#[command(about = "Signaling server for devnet peers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, overridden by RUST_LOG
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// Print the digest to store in a [[users]] entry
    Hash {
        /// User name
        name: String,
        /// User secret
        secret: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(Command::Hash { name, secret }) = &cli.command {
        println!("{}", hash_secret(name, secret));
        return ExitCode::SUCCESS;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => match ServerConfig::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                error!(error = %err, "failed to load config");
                return ExitCode::FAILURE;
            }
        },
        None => {
            info!("no config file given, using defaults");
            ServerConfig::default()
        }
    };
    if config.users.is_empty() {
        warn!("no users configured, every connection will be rejected");
    }

    let credentials = StaticCredentials::new(config.users.clone());
    let relays = config.ice_servers.clone();
    let server = match SignalingServer::bind(&config, credentials, relays).await {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, "failed to start server");
            return ExitCode::FAILURE;
        }
    };

    match server.serve(shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "server failed");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
