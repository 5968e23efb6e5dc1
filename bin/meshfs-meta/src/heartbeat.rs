//! Periodic status probing of storage nodes

use crate::back_channel::BackChannel;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

/// Running heartbeat task
pub struct Heartbeat {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    pub fn spawn(back_channel: Arc<BackChannel>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(back_channel, interval, stop_rx));
        Self { stop_tx, handle }
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            error!("heartbeat task failed: {}", e);
        }
    }
}

async fn run(back_channel: Arc<BackChannel>, interval: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!("heartbeat every {:?}", interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => back_channel.heartbeat().await,
            _ = stop.changed() => break,
        }
    }
    debug!("heartbeat stopped");
}
