//! quay-dns binary entry point.

use clap::Parser;
use quay_dns::{telemetry, Config, Server};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Authoritative DNS for container-declared hostnames.
#[derive(Parser, Debug)]
#[command(name = "quay-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "quay-dns.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration: file first, environment overrides on top.
    let mut config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()).required(false))
        .add_source(
            config::Environment::with_prefix("QUAY_DNS")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    config.cluster.resolve_node_name();
    config.validate()?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        listen_addr = %config.dns.listen_addr,
        host_ip = %config.dns.host_ip,
        "starting quay-dns"
    );

    // Graceful shutdown on ctrl-c.
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("unable to listen for shutdown signal: {e}");
            return;
        }
        info!("received ctrl-c, shutting down");
        signal_token.cancel();
    });

    let server = Server::new(config);
    if let Err(e) = server.run(token).await {
        error!("server error: {e}");
        return Err(e.into());
    }

    info!("quay-dns shutdown complete");
    Ok(())
}
