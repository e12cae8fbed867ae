//! HTTP stub server - CLI entry point

use anyhow::Result;
use clap::Parser;
use http_stub_server::{HttpTransport, StubRepository, StubServer, StubsConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "http-stub-server",
    about = "HTTP stub server - request stubbing, response sequencing, and upstream recording",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "stubs.yaml")]
    config: PathBuf,

    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8882")]
    address: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let default_config = include_str!("../demos/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    let config_exists = args.config.exists();
    let config = if config_exists {
        info!(path = ?args.config, "Loading configuration");
        StubsConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no stubs)");
        StubsConfig::default()
    };

    if args.validate {
        println!(
            "Configuration is valid ({} stubs defined)",
            config.stubs.len()
        );
        return Ok(());
    }

    let base_dir = args
        .config
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let entries = config.to_entries(&base_dir)?;

    let transport = HttpTransport::new(Duration::from_millis(
        config.settings.recording_timeout_ms,
    ))?;
    let repository = Arc::new(StubRepository::new(Arc::new(transport)));
    repository.reset_stubs_cache(entries);

    let mut server = StubServer::new(repository, config.settings);
    if config_exists {
        server = server.with_config_path(args.config);
    }
    let server = Arc::new(server);

    tokio::select! {
        result = server.run(args.address) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
