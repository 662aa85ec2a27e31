use std::io;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use sitebudget::alarm::spawn_daily_alarm;
use sitebudget::api::{server, Router};
use sitebudget::config::{AppConfig, StoreKind};
use sitebudget::enforcement::{EnforcementChannel, FileRuleBackend, MemoryRuleBackend, RuleBackend};
use sitebudget::registry::store::SiteStore;
use sitebudget::registry::{JsonFileStore, MemoryStore, RedisStore, SiteRegistry};
use sitebudget::tabs::TabHub;
use sitebudget::time::SystemClock;
use sitebudget::utils::{logging, metrics, metrics_channel};
use sitebudget::{BlockingService, ServiceError};

fn other(e: impl ToString) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

async fn open_store(config: &AppConfig) -> io::Result<Arc<dyn SiteStore>> {
    let store: Arc<dyn SiteStore> = match config.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::File => Arc::new(JsonFileStore::open(config.sites_file()).await.map_err(other)?),
        StoreKind::Redis => {
            let url = config.redis_url.as_deref().unwrap_or_default();
            Arc::new(RedisStore::with_prefix(url, &config.redis_prefix).await.map_err(other)?)
        }
    };
    Ok(store)
}

async fn open_rule_backend(config: &AppConfig) -> io::Result<Arc<dyn RuleBackend>> {
    let backend: Arc<dyn RuleBackend> = match &config.rules_file {
        Some(path) => Arc::new(FileRuleBackend::open(path).await.map_err(other)?),
        None => Arc::new(MemoryRuleBackend::new()),
    };
    Ok(backend)
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = logging::init_logging(config.log_level, config.log_file.as_deref(), true, true) {
        eprintln!("Failed to initialize logger: {}", e);
    }

    let _metrics_registry = metrics::init(config.metrics);
    match metrics::register_site_metrics().await {
        Ok(()) => info!("Site metrics registered"),
        Err(e) => error!("Failed to register metrics: {}", e),
    }
    metrics_channel::init_metrics_channel();
    if config.metrics && config.metrics_report_secs > 0 {
        if let Err(e) = metrics::start_console_reporter(config.metrics_report_secs).await {
            error!("Failed to start metrics reporter: {}", e);
        }
    }

    let store = open_store(&config).await?;
    let backend = open_rule_backend(&config).await?;
    info!("Using {} site store and {} rule backend", store.name(), backend.name());

    let service = Arc::new(BlockingService::new(
        Arc::new(SiteRegistry::new(store)),
        Arc::new(EnforcementChannel::new(backend, config.block_page.clone())),
        Arc::new(TabHub::new()),
        Arc::new(SystemClock),
    ));

    match service.startup().await {
        Ok(report) => info!(
            "Rules in sync: {} added, {} removed, {} kept",
            report.added, report.removed, report.kept
        ),
        // rules are a cache; the next decision repairs them
        Err(ServiceError::Enforcement(e)) => warn!("Startup rule sync failed: {}", e),
        Err(e) => {
            error!("Startup failed: {}", e);
            return Err(other(e));
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let alarm = spawn_daily_alarm(service.clone(), shutdown_rx);

    print_banner(&config);

    let router = Arc::new(Router::new(service));
    let result = server::serve(config.bind_addr, router, config.checkpoint_every(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutting down");
    })
    .await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = alarm.await {
        warn!("Daily alarm task ended abnormally: {}", e);
    }

    result
}

fn print_banner(config: &AppConfig) {
    println!("\n{}", "═".repeat(72));
    println!(
        "  {}  listening on {}",
        console::style("sitebudget").cyan().bold(),
        console::style(config.bind_addr).green()
    );
    println!("  {} POST http://{}/api/rpc", console::style("rpc").bold(), config.bind_addr);
    println!("  {} GET  http://{}/api/sites", console::style("sites").bold(), config.bind_addr);
    println!("  {} WS   ws://{}/api/tabs/{{id}}/ws?url=<page>", console::style("tabs").bold(), config.bind_addr);
    if config.metrics {
        println!("  {} GET  http://{}/metrics", console::style("metrics").bold(), config.bind_addr);
    }
    println!("{}\n", "═".repeat(72));
}
