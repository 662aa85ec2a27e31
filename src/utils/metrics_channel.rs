//! Fire-and-forget metric updates from synchronous code.
//!
//! Updates are queued to a background task that applies them to the global
//! registry. Before `init_metrics_channel` runs every call is a no-op, which
//! keeps library users and tests free of metrics plumbing.
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::utils::metrics;

const CHANNEL_CAPACITY: usize = 10_000;

#[derive(Clone, Debug)]
pub enum MetricsMessage {
    Counter { name: String },
    Timer { name: String, duration: Duration },
}

static METRICS_SENDER: OnceLock<mpsc::Sender<MetricsMessage>> = OnceLock::new();

/// Spawn the background consumer. Must run inside a tokio runtime.
pub fn init_metrics_channel() {
    if METRICS_SENDER.get().is_some() {
        return;
    }

    let (tx, rx) = mpsc::channel::<MetricsMessage>(CHANNEL_CAPACITY);
    if METRICS_SENDER.set(tx).is_ok() {
        tokio::spawn(process_metrics_messages(rx));
    }
}

async fn process_metrics_messages(mut rx: mpsc::Receiver<MetricsMessage>) {
    while let Some(message) = rx.recv().await {
        let result = match &message {
            MetricsMessage::Counter { name } => metrics::increment_counter(name).await,
            MetricsMessage::Timer { name, duration } => metrics::record_timer(name, *duration).await,
        };
        if let Err(e) = result {
            trace!("Dropped {:?}: {}", message, e);
        }
    }
}

fn send(message: MetricsMessage) {
    let Some(sender) = METRICS_SENDER.get() else {
        return;
    };
    if let Err(e) = sender.try_send(message) {
        warn!("Metrics queue rejected an update: {}", e);
    }
}

pub fn increment_counter(name: &str) {
    send(MetricsMessage::Counter { name: name.to_string() });
}

pub fn record_timer(name: &str, duration: Duration) {
    send(MetricsMessage::Timer {
        name: name.to_string(),
        duration,
    });
}

/// Records the elapsed time on drop
pub struct TimerGuard {
    name: &'static str,
    start: Instant,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        record_timer(self.name, self.start.elapsed());
    }
}

pub fn start_timer(name: &'static str) -> TimerGuard {
    TimerGuard {
        name,
        start: Instant::now(),
    }
}
