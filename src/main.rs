//! punch-forward
//!
//! Exposes services running next to a Server peer as local ports on a
//! Client peer, traversing NATs via STUN discovery, UDP hole punching and
//! relay fallback. Peers rendezvous through a small HTTP key/value endpoint
//! scoped by a shared room id.
//!
//! Usage:
//!   punch-forward --config config.yml

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use punch_forward::config::{Config, Mode};
use punch_forward::{client, error::Error, server};

#[derive(Parser)]
#[command(name = "punch-forward")]
#[command(version)]
#[command(about = "P2P port forwarding through NATs with hole punching and relay fallback")]
struct Args {
    /// Path to the configuration file (YAML or JSON)
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let default_filter = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    log::info!(
        "loaded configuration: mode {}, room '{}', {} mappings",
        config.mode,
        config.room_id,
        config.mappings.len()
    );

    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_shutdown_signal(cancel.clone()));

    let result = match config.mode {
        Mode::Client => client::run(config, args.config, cancel.clone()).await,
        Mode::Server => server::run(config, cancel.clone()).await,
    };

    match result {
        Ok(()) | Err(Error::Cancelled) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Cancel the root token on SIGINT or SIGTERM.
async fn wait_for_shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                log::warn!("could not install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                log::info!("received shutdown signal, stopping...");
                cancel.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    log::info!("received shutdown signal, stopping...");
    cancel.cancel();
}
