//! # Tank Middleware
//!
//! Drives a [`TankModel`]:
//! - **Receiver**: pulls messages from the transport and dispatches them
//! - **Simulation**: advances the fish every `tick_interval_ms`
//! - **Registration**: repeats RegisterRequest every `register_retry_ms`
//!   until the first RegisterResponse arrives (the secure transport holds the
//!   first request back while it agrees a key with the broker)
//!
//! Lease renewal and token dwell timers belong to the model itself.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let transport = transport::bind(config.bind_address, config.secure).await?;
//! let model = Arc::new(TankModel::new(config.clone(), transport));
//! let middleware = TankMiddleware::new(config, Arc::clone(&model));
//! middleware.run().await?;
//! ```

use anyhow::Result;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::model::TankModel;
use crate::common::config::TankConfig;
use crate::transport::RECEIVE_BACKOFF;

pub struct TankMiddleware {
    config: TankConfig,
    model: Arc<TankModel>,
}

impl TankMiddleware {
    pub fn new(config: TankConfig, model: Arc<TankModel>) -> Self {
        Self { config, model }
    }

    pub fn model(&self) -> Arc<TankModel> {
        Arc::clone(&self.model)
    }

    /// Run until a Shutdown message arrives or the transport is closed.
    /// Other receive errors are logged and skipped.
    pub async fn run(&self) -> Result<()> {
        info!(
            "🚀 Tank on {} joining the ring via {}",
            self.model.local_addr(),
            self.config.broker_address
        );

        let simulation = self.start_simulation();
        let registration = self.start_registration();

        let transport = self.model.transport();
        let outcome = loop {
            match transport.blocking_receive().await {
                Ok(envelope) => {
                    if !self.model.dispatch(envelope).await {
                        break Ok(());
                    }
                }
                Err(e) if transport.is_closed() => {
                    error!("❌ Transport closed, stopping: {}", e);
                    break Err(e);
                }
                Err(e) => {
                    warn!("⚠️  Receive failed: {}", e);
                    tokio::time::sleep(RECEIVE_BACKOFF).await;
                }
            }
        };

        simulation.abort();
        registration.abort();
        outcome
    }

    fn start_simulation(&self) -> JoinHandle<()> {
        let model = Arc::clone(&self.model);
        let period = self.config.tick_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                model.update().await;
            }
        })
    }

    fn start_registration(&self) -> JoinHandle<()> {
        let model = Arc::clone(&self.model);
        let retry = self.config.register_retry();
        tokio::spawn(async move {
            while !model.is_registered().await {
                model.request_registration().await;
                tokio::time::sleep(retry).await;
            }
        })
    }
}
