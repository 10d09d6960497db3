//! VitaLink daemon
//!
//! Runs the local-network companion server: loads configuration, assembles
//! the protocol components and serves until interrupted. Subcommands cover
//! the operator surface: opening a pairing session, listing and revoking
//! devices, printing the identity fingerprint.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use vitalink_protocol::{
    IdentityStore, LogAuditSink, NetworkServer, PairingService, SqliteDeviceStore, StaticProvider,
};

use config::Config;

#[derive(Parser)]
#[command(name = "vitalink-daemon", version, about = "VitaLink local-network companion server")]
struct Cli {
    /// Path to the configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (default)
    Run,
    /// Run the server with a pairing session open, printing the QR payload
    Pair,
    /// List paired devices
    Devices,
    /// Revoke every paired device
    RevokeAll,
    /// Print the TLS identity fingerprint
    Fingerprint,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = Some(data_dir);
    }
    config.ensure_directories()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, false).await,
        Command::Pair => run(config, true).await,
        Command::Devices => list_devices(config).await,
        Command::RevokeAll => revoke_all(config).await,
        Command::Fingerprint => print_fingerprint(config).await,
    }
}

fn init_tracing(verbose: u8) {
    let default_filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_pairing(config: &Config) -> Result<Arc<PairingService>> {
    let store = SqliteDeviceStore::open(config.devices_db_path())
        .context("opening paired-device database")?;
    Ok(Arc::new(PairingService::new(
        config.pairing_config(),
        Box::new(store),
    )))
}

async fn run(config: Config, open_pairing: bool) -> Result<()> {
    let identity_store = Arc::new(IdentityStore::new(config.identity_config()));
    let pairing = build_pairing(&config)?;

    // The health-data provider is wired by the embedding application; the
    // standalone daemon serves only the built-in routes.
    let provider = Arc::new(StaticProvider::new());
    let audit = Arc::new(LogAuditSink);

    let server = NetworkServer::new(
        config.server_config(),
        identity_store,
        pairing,
        provider,
        audit,
    );

    let port = server.start().await.context("starting server")?;
    let fingerprint = server.fingerprint().await.unwrap_or_default();
    info!("VitaLink server ready on port {} ({})", port, fingerprint);

    if open_pairing {
        let payload = server.begin_pairing().await.context("opening pairing session")?;
        println!("Pairing session open until {}", payload.expires_at);
        println!("Code:        {}", payload.code);
        println!("Fingerprint: {}", payload.certificate_fingerprint);
        println!("QR payload:  {}", payload.to_qr_string()?);
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");
    server.stop().await;

    Ok(())
}

async fn list_devices(config: Config) -> Result<()> {
    let pairing = build_pairing(&config)?;
    let devices = pairing.list_devices().await?;

    if devices.is_empty() {
        println!("No paired devices.");
        return Ok(());
    }

    for device in devices {
        let state = if device.is_active { "active" } else { "revoked" };
        println!(
            "{}  {}  {}  paired {}  last seen {}  expires {}",
            device.id,
            device.anonymized_name,
            state,
            device.created_at.format("%Y-%m-%d"),
            device.last_seen_at.format("%Y-%m-%d %H:%M"),
            device.expires_at.format("%Y-%m-%d"),
        );
    }

    Ok(())
}

async fn revoke_all(config: Config) -> Result<()> {
    let pairing = build_pairing(&config)?;
    let count = pairing.revoke_all().await?;
    println!("Revoked {count} paired device(s).");
    Ok(())
}

async fn print_fingerprint(config: Config) -> Result<()> {
    let store = IdentityStore::new(config.identity_config());
    let identity = store.load_or_create().await.context("loading identity")?;
    println!("{}", identity.fingerprint);
    Ok(())
}
