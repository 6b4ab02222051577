//! Application context built once at startup and passed explicitly.
//!
//! No module-level singletons: every component receives its dependencies
//! here, and shutdown happens by dropping the context after the server loop
//! exits.

use crate::config::Config;
use crate::db::Store;
use crate::inventory::InventoryManager;
use crate::metrics::MetricsTracker;
use crate::pairing::{
    ChatCompletionProvider, ExperimentAllocator, ExperimentConfig, PairingOrchestrator,
    PairingProvider,
};
use crate::realtime::{HubConfig, RealtimeHub};
use crate::sync::SyncReconciler;
use crate::weather::{OpenMeteoClient, WeatherEnricher};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub inventory: Arc<InventoryManager>,
    pub reconciler: Arc<SyncReconciler>,
    pub pairing: Arc<PairingOrchestrator>,
    pub weather: Arc<WeatherEnricher>,
    pub hub: Arc<RealtimeHub>,
    pub metrics: Arc<MetricsTracker>,
}

impl AppState {
    pub fn build(config: Config) -> Result<Self> {
        let store = Store::open(&config.database_path)
            .with_context(|| format!("opening store at {}", config.database_path))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.provider_timeout_ms))
            .build()
            .context("building http client")?;

        let metrics = Arc::new(MetricsTracker::new(config.metrics_window));
        let hub = Arc::new(RealtimeHub::new(HubConfig {
            max_connections: config.max_connections,
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
        }));

        let inventory = Arc::new(InventoryManager::new(
            store.clone(),
            hub.clone(),
            metrics.clone(),
        ));
        let reconciler = Arc::new(SyncReconciler::new(
            store.clone(),
            hub.clone(),
            metrics.clone(),
            config.sync_tiebreaker,
        ));

        let mut ai_providers: Vec<Arc<dyn PairingProvider>> = Vec::new();
        let mut narrative_ai = None;
        if !config.external_calls_disabled {
            if let Some(key) = config.primary_ai_key.clone() {
                let provider = ChatCompletionProvider::deepseek(http.clone(), key);
                narrative_ai = Some(provider.clone());
                ai_providers.push(Arc::new(provider));
            }
            if let Some(key) = config.secondary_ai_key.clone() {
                ai_providers.push(Arc::new(ChatCompletionProvider::openai(http.clone(), key)));
            }
        }
        if ai_providers.is_empty() {
            info!("🤖 No AI providers configured; pairing runs on the heuristic engine");
        }

        let pairing = Arc::new(PairingOrchestrator::new(
            store.clone(),
            inventory.clone(),
            metrics.clone(),
            ai_providers,
            ExperimentAllocator::new(ExperimentConfig::default()),
            config.pairing_cache_max,
            Duration::from_millis(config.pairing_cache_ttl_ms),
            Duration::from_millis(config.provider_timeout_ms),
        ));

        let weather_client = OpenMeteoClient::new(
            http,
            config.weather_base_url.clone(),
            Duration::from_millis(config.weather_timeout_ms),
        );
        let weather = Arc::new(WeatherEnricher::new(
            store.clone(),
            weather_client,
            narrative_ai,
            config.external_calls_disabled,
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            inventory,
            reconciler,
            pairing,
            weather,
            hub,
            metrics,
        })
    }
}
