use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::info;

/// Metrics errors
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metrics not initialized")]
    NotInitialized,

    #[error("Counter not found: {0}")]
    CounterNotFound(String),

    #[error("Timer not found: {0}")]
    TimerNotFound(String),
}

/// Result type for metrics operations
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Atomic counter for metrics
#[derive(Debug)]
struct Counter {
    value: AtomicU64,
    description: String,
}

impl Counter {
    fn new(description: &str) -> Self {
        Self {
            value: AtomicU64::new(0),
            description: description.to_string(),
        }
    }

    fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    fn add(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Timer for measuring durations
#[derive(Debug)]
struct Timer {
    count: AtomicU64,
    sum: AtomicU64, // nanoseconds
    min: AtomicU64, // nanoseconds
    max: AtomicU64, // nanoseconds
    description: String,
}

impl Timer {
    fn new(description: &str) -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            description: description.to_string(),
        }
    }

    fn record(&self, duration: Duration) {
        let nanos = duration.as_nanos().min(u64::MAX as u128) as u64;

        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(nanos, Ordering::Relaxed);
        self.min.fetch_min(nanos, Ordering::Relaxed);
        self.max.fetch_max(nanos, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn min(&self) -> Duration {
        match self.min.load(Ordering::Relaxed) {
            u64::MAX => Duration::ZERO,
            min => Duration::from_nanos(min),
        }
    }

    fn max(&self) -> Duration {
        Duration::from_nanos(self.max.load(Ordering::Relaxed))
    }

    fn sum(&self) -> Duration {
        Duration::from_nanos(self.sum.load(Ordering::Relaxed))
    }

    fn avg(&self) -> Duration {
        match self.count() {
            0 => Duration::ZERO,
            count => Duration::from_nanos(self.sum.load(Ordering::Relaxed) / count),
        }
    }
}

/// Metrics registry
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, Arc<Counter>>>,
    timers: RwLock<HashMap<String, Arc<Timer>>>,
    enabled: AtomicBool,
}

impl MetricsRegistry {
    fn new(enabled: bool) -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            timers: RwLock::new(HashMap::new()),
            enabled: AtomicBool::new(enabled),
        }
    }

    async fn register_counter(&self, name: &str, description: &str) {
        self.counters
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Counter::new(description)));
    }

    async fn register_timer(&self, name: &str, description: &str) {
        self.timers
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Timer::new(description)));
    }

    async fn get_counter(&self, name: &str) -> MetricsResult<Arc<Counter>> {
        self.counters
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| MetricsError::CounterNotFound(name.to_string()))
    }

    async fn get_timer(&self, name: &str) -> MetricsResult<Arc<Timer>> {
        self.timers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| MetricsError::TimerNotFound(name.to_string()))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Snapshot of every counter and timer, sorted by name
    pub async fn collect_metrics(&self) -> Metrics {
        let mut counters: Vec<CounterMetric> = self
            .counters
            .read()
            .await
            .iter()
            .map(|(name, counter)| CounterMetric {
                name: name.clone(),
                value: counter.value(),
                description: counter.description.clone(),
            })
            .collect();
        counters.sort_by(|a, b| a.name.cmp(&b.name));

        let mut timers: Vec<TimerMetric> = self
            .timers
            .read()
            .await
            .iter()
            .map(|(name, timer)| TimerMetric {
                name: name.clone(),
                count: timer.count(),
                sum_ms: timer.sum().as_millis() as u64,
                min_ms: timer.min().as_millis() as u64,
                max_ms: timer.max().as_millis() as u64,
                avg_ms: timer.avg().as_millis() as u64,
                description: timer.description.clone(),
            })
            .collect();
        timers.sort_by(|a, b| a.name.cmp(&b.name));

        Metrics { counters, timers }
    }
}

/// Global metrics registry
static METRICS: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();

/// Initialize the metrics system. Later calls return the first registry.
pub fn init(enabled: bool) -> Arc<MetricsRegistry> {
    METRICS
        .get_or_init(|| Arc::new(MetricsRegistry::new(enabled)))
        .clone()
}

/// Get the global metrics registry
pub fn registry() -> MetricsResult<Arc<MetricsRegistry>> {
    METRICS.get().cloned().ok_or(MetricsError::NotInitialized)
}

/// Counter metric for JSON serialization
#[derive(Serialize, Debug)]
pub struct CounterMetric {
    pub name: String,
    pub value: u64,
    pub description: String,
}

/// Timer metric for JSON serialization
#[derive(Serialize, Debug)]
pub struct TimerMetric {
    pub name: String,
    pub count: u64,
    pub sum_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
    pub description: String,
}

/// Complete metrics structure for JSON serialization
#[derive(Serialize, Debug, Default)]
pub struct Metrics {
    pub counters: Vec<CounterMetric>,
    pub timers: Vec<TimerMetric>,
}

pub async fn increment_counter(name: &str) -> MetricsResult<()> {
    add_to_counter(name, 1).await
}

pub async fn add_to_counter(name: &str, value: u64) -> MetricsResult<()> {
    let registry = registry()?;

    if registry.is_enabled() {
        let counter = registry.get_counter(name).await?;
        if value == 1 {
            counter.increment();
        } else {
            counter.add(value);
        }
    }

    Ok(())
}

/// Record a duration on a registered timer. Unknown timers are an error.
pub async fn record_timer(name: &str, duration: Duration) -> MetricsResult<()> {
    let registry = registry()?;

    if registry.is_enabled() {
        registry.get_timer(name).await?.record(duration);
    }

    Ok(())
}

/// Register the counters and timers the service reports
pub async fn register_site_metrics() -> MetricsResult<()> {
    let registry = registry()?;

    registry.register_counter("decisions.total", "Blocking decisions made").await;
    registry.register_counter("decisions.blocked", "Decisions that blocked the page").await;
    registry.register_counter("enforcement.errors", "Rule updates that failed").await;
    registry.register_counter("sessions.checkpoints", "Remaining-time checkpoints stored").await;
    registry.register_counter("sites.added", "Sites registered").await;
    registry.register_counter("sites.removed", "Sites deleted").await;
    registry.register_counter("daily_reset.runs", "Daily reset passes").await;

    registry.register_timer("decision.duration", "Time taken to decide on a URL").await;
    registry.register_timer("rpc.duration", "Time taken to answer an API request").await;

    Ok(())
}

/// Log the counters that changed every `interval_sec` seconds
pub async fn start_console_reporter(interval_sec: u64) -> MetricsResult<()> {
    let registry = registry()?;

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_sec.max(1)));
        let mut last: HashMap<String, u64> = HashMap::new();

        loop {
            ticker.tick().await;
            if !registry.is_enabled() {
                continue;
            }

            let metrics = registry.collect_metrics().await;
            for counter in &metrics.counters {
                let previous = last.insert(counter.name.clone(), counter.value).unwrap_or(0);
                if counter.value != previous {
                    info!("metric {} = {} (+{})", counter.name, counter.value, counter.value - previous);
                }
            }
            for timer in metrics.timers.iter().filter(|t| t.count > 0) {
                info!(
                    "metric {}: count {}, avg {}ms, min {}ms, max {}ms",
                    timer.name, timer.count, timer.avg_ms, timer.min_ms, timer.max_ms
                );
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_counters_show_up_sorted() {
        let registry = MetricsRegistry::new(true);
        registry.register_counter("b", "second").await;
        registry.register_counter("a", "first").await;
        registry.register_timer("t", "timer").await;

        registry.get_counter("a").await.unwrap().add(3);
        registry.get_timer("t").await.unwrap().record(Duration::from_millis(4));
        registry.get_timer("t").await.unwrap().record(Duration::from_millis(8));

        let metrics = registry.collect_metrics().await;
        let names: Vec<&str> = metrics.counters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(metrics.counters[0].value, 3);

        let timer = &metrics.timers[0];
        assert_eq!((timer.count, timer.min_ms, timer.max_ms, timer.avg_ms), (2, 4, 8, 6));
    }

    #[tokio::test]
    async fn unknown_names_are_errors() {
        let registry = MetricsRegistry::new(true);
        assert!(matches!(
            registry.get_counter("missing").await,
            Err(MetricsError::CounterNotFound(_))
        ));
    }
}
