use std::path::PathBuf;

use clap::Parser;
use log::info;

use tempolink_server::config::ServerConfig;
use tempolink_server::server::Server;

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the YAML configuration file (created with defaults if missing)
    #[clap(short, long, default_value = "server-config.yml")]
    config: PathBuf,

    /// Override the configured listen port
    #[clap(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::init();

    // Print a message about setting RUST_LOG if not set
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    // Parse command line arguments
    let args = Args::parse();
    let mut config = ServerConfig::load(&args.config)?;
    if let Some(port) = args.port {
        config.port = port;
    }

    info!(
        "starting session server on [{}]:{} (identity service: {})",
        config.bind_ip, config.port, config.api_url
    );

    let server = Server::new(config)?;
    server.run().await?;
    Ok(())
}
