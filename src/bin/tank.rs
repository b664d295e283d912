//! # Tank Binary Entry Point
//!
//! Runs one tank headless. State changes are rendered as log lines.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin tank -- --config config/ring.toml --fish 3 --snapshot-after 10
//! cargo run --bin tank -- --locate fish0@tank1
//! ```
//!
//! The tank will:
//! 1. Register with the broker and receive its neighbors
//! 2. Add `--fish` extra fish at random positions once registered
//! 3. Start a snapshot after `--snapshot-after` seconds (optional)
//! 4. Look up a fish id through the ring (optional, 5 seconds after joining)
//! 5. On Ctrl-C, pass the token on if held and deregister

use anyhow::Result;
use clap::Parser;
use log::{debug, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use tank_ring::common::config::RingConfig;
use tank_ring::common::fish::{FISH_HEIGHT, FISH_WIDTH, HEIGHT, WIDTH};
use tank_ring::common::logging::init_logger;
use tank_ring::tank::{TankEvent, TankMiddleware, TankModel};
use tank_ring::transport;

/// How often the renderer prints a summary line.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(5);
const LOCATE_DELAY: Duration = Duration::from_secs(5);

/// Command-line arguments for the tank binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    /// Extra fish to create once registered (capped by max_fishies)
    #[arg(long, default_value_t = 0)]
    fish: usize,

    /// Start a snapshot this many seconds after registering
    #[arg(long)]
    snapshot_after: Option<u64>,

    /// Fish id to look up through the ring
    #[arg(long)]
    locate: Option<String>,
}

/// Log-line renderer standing in for a graphical view.
async fn render(model: Arc<TankModel>) {
    let mut events = model.subscribe();
    let mut last_summary = Instant::now();

    loop {
        match events.recv().await {
            Ok(TankEvent::Registered { id }) => info!("🏷️  This tank is {}", id),
            Ok(TankEvent::TokenChanged(held)) => {
                debug!("🎟️  Token {}", if held { "acquired" } else { "passed on" })
            }
            Ok(TankEvent::FishLocated { fish_id, found }) => {
                if found {
                    info!("🔦 {} is swimming here", fish_id);
                } else {
                    info!("🔦 {} could not be found", fish_id);
                }
            }
            Ok(TankEvent::SnapshotCompleted { total }) => {
                info!("📊 Global snapshot: {} fish in the ring", total)
            }
            Ok(TankEvent::Updated) => {
                if last_summary.elapsed() >= SUMMARY_INTERVAL {
                    last_summary = Instant::now();
                    let id = model.id().await.unwrap_or_else(|| "unregistered".into());
                    let token = if model.has_token().await { "yes" } else { "no" };
                    let fishies = model.fishies().await;
                    let ids: Vec<&str> = fishies
                        .iter()
                        .filter(|f| f.is_swimming())
                        .map(|f| f.id.as_str())
                        .collect();
                    info!("🐠 {} | token: {} | fish: [{}]", id, token, ids.join(", "));
                }
            }
            Err(RecvError::Lagged(skipped)) => debug!("Renderer skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Scripted user input: extra fish, snapshot, location query.
async fn drive(model: Arc<TankModel>, fish: usize, snapshot_after: Option<u64>, locate: Option<String>) {
    while !model.is_registered().await {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for _ in 0..fish {
        let (x, y) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(0..WIDTH - FISH_WIDTH),
                rng.gen_range(0..HEIGHT - FISH_HEIGHT),
            )
        };
        if model.new_fish(x, y).await.is_none() {
            warn!("⚠️  Tank is full, skipping remaining fish");
            break;
        }
    }

    if let Some(fish_id) = locate {
        let model = Arc::clone(&model);
        tokio::spawn(async move {
            tokio::time::sleep(LOCATE_DELAY).await;
            info!("🔎 Looking for {}", fish_id);
            model.locate_fish_globally(&fish_id).await;
        });
    }

    if let Some(secs) = snapshot_after {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        match model.initiate_snapshot().await {
            Some(round) => info!("📸 Snapshot {} started", round),
            None => warn!("⚠️  A snapshot is already running"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logger();

    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration (defaults when no file is given)
    let config = RingConfig::from_optional_file(args.config.as_deref())?.tank;

    let transport = transport::bind(config.bind_address, config.secure).await?;
    let model = Arc::new(TankModel::new(config.clone(), transport));
    let middleware = TankMiddleware::new(config, Arc::clone(&model));

    tokio::spawn(render(Arc::clone(&model)));
    tokio::spawn(drive(
        Arc::clone(&model),
        args.fish,
        args.snapshot_after,
        args.locate,
    ));

    tokio::select! {
        result = middleware.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("⌨️  Ctrl-C received, leaving the ring");
            model.finish().await;
            // Give deferred sends a moment to go out
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
    }

    Ok(())
}
