//! # Broker Binary Entry Point
//!
//! Thin wrapper that binds the transport and runs the ring broker.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin broker -- --config config/ring.toml
//! ```
//!
//! Without `--config` every setting takes its default (listening on
//! 127.0.0.1:4711). Ctrl-C sends the broker its own Shutdown message, so
//! in-flight work drains the same way as for a remote shutdown.

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tank_ring::broker::Broker;
use tank_ring::common::config::RingConfig;
use tank_ring::common::logging::init_logger;
use tank_ring::common::messages::Message;
use tank_ring::transport::{self, Endpoint, Transport};

/// Command-line arguments for the broker binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (TOML format)
    ///
    /// Example: config/ring.toml
    #[arg(short, long)]
    config: Option<String>,
}

/// Send a plain Shutdown to the broker from a throwaway socket.
async fn request_shutdown(broker: SocketAddr) -> Result<()> {
    let target = if broker.ip().is_unspecified() {
        let loopback = match broker.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        SocketAddr::new(loopback, broker.port())
    } else {
        broker
    };

    let bind = SocketAddr::new(target.ip(), 0);
    let endpoint = Endpoint::bind(bind).await?;
    endpoint.send(target, &Message::Shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logger();

    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration (defaults when no file is given)
    let config = RingConfig::from_optional_file(args.config.as_deref())?.broker;

    let transport = transport::bind(config.address, config.secure).await?;
    let broker = Broker::new(config, transport);

    let address = broker.local_addr();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("⌨️  Ctrl-C received, shutting down");
            if let Err(e) = request_shutdown(address).await {
                error!("❌ Could not deliver shutdown: {}", e);
            }
        }
    });

    // Runs until a Shutdown message arrives
    broker.run().await
}
