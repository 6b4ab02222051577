//! Pairing orchestration: fingerprint, cache, single-flight, provider chain.
//!
//! The chain runs primary AI, secondary AI, then the heuristic engine, each
//! under its own deadline. Concurrent identical requests share one build via
//! a per-fingerprint broadcast channel; a lone caller cancelling aborts the
//! in-flight build, while a cancelled leader with waiters leaves the build
//! running for them.

use crate::db::Store;
use crate::error::{CoreError, CoreResult};
use crate::inventory::{InventoryManager, StockFilters};
use crate::metrics::MetricsTracker;
use crate::models::StockView;
use crate::pairing::{
    cache::PairingCache,
    experiment::{ExperimentAllocator, PairingVariant},
    fingerprint::fingerprint,
    heuristic::HeuristicEngine,
    providers::PairingProvider,
    PairingFeedback, PairingRequest, PairingResult, ProviderKind, WineSelection,
};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const HEURISTIC_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_RECOMMENDATIONS_CEILING: usize = 12;

/// Outcome shared with concurrent waiters on the same fingerprint.
type SharedOutcome = Result<Arc<PairingResult>, String>;

#[derive(Clone)]
pub struct PairingOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    inventory: Arc<InventoryManager>,
    metrics: Arc<MetricsTracker>,
    cache: PairingCache,
    ai_providers: Vec<Arc<dyn PairingProvider>>,
    allocator: Mutex<ExperimentAllocator>,
    inflight: Mutex<HashMap<String, broadcast::Sender<SharedOutcome>>>,
    provider_timeout: Duration,
}

impl PairingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        inventory: Arc<InventoryManager>,
        metrics: Arc<MetricsTracker>,
        ai_providers: Vec<Arc<dyn PairingProvider>>,
        allocator: ExperimentAllocator,
        cache_max: usize,
        cache_ttl: Duration,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                inventory,
                metrics,
                cache: PairingCache::new(cache_max, cache_ttl),
                ai_providers,
                allocator: Mutex::new(allocator),
                inflight: Mutex::new(HashMap::new()),
                provider_timeout,
            }),
        }
    }

    /// Produce a pairing for the request. Cache hits short-circuit; misses
    /// run (or join) a single provider-chain build for the fingerprint.
    pub async fn recommend(&self, request: PairingRequest) -> CoreResult<Arc<PairingResult>> {
        if request.dish.trim().is_empty() {
            return Err(CoreError::invalid("dish must not be empty"));
        }
        let mut request = request;
        request.options.max_recommendations = request
            .options
            .max_recommendations
            .clamp(1, MAX_RECOMMENDATIONS_CEILING);

        let inner = &self.inner;
        inner.metrics.record_pairing_request();

        let inventory = inner.available_inventory()?;
        let fp = fingerprint(
            &request.dish,
            &request.context,
            &request.preferences,
            &request.options,
            &inventory,
        );

        loop {
            if let Some(cached) = inner.cache.get(&fp) {
                // A cached selection may have sold out since it was built;
                // never report a vintage with no available bottles.
                let available = inner.available_ids()?;
                let filtered: Vec<WineSelection> = cached
                    .selections
                    .iter()
                    .filter(|s| available.contains(&s.vintage_id))
                    .cloned()
                    .collect();
                if !filtered.is_empty() {
                    inner.metrics.record_cache_hit();
                    return Ok(Arc::new(PairingResult {
                        recommendation_id: cached.recommendation_id.clone(),
                        fingerprint: cached.fingerprint.clone(),
                        provider: cached.provider,
                        selections: filtered,
                        from_cache: true,
                    }));
                }
                inner.cache.invalidate(&fp);
            }

            enum Role {
                Leader(broadcast::Sender<SharedOutcome>),
                Follower(broadcast::Receiver<SharedOutcome>),
            }

            let role = {
                let mut inflight = inner.inflight.lock();
                match inflight.get(&fp) {
                    Some(tx) => Role::Follower(tx.subscribe()),
                    None => {
                        let (tx, _rx) = broadcast::channel(1);
                        inflight.insert(fp.clone(), tx.clone());
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Follower(mut rx) => match rx.recv().await {
                    Ok(Ok(result)) => return Ok(result),
                    Ok(Err(code)) => {
                        return Err(match code.as_str() {
                            "pairing_failed" => CoreError::PairingFailed,
                            other => {
                                CoreError::ProviderError(format!("shared build failed: {other}"))
                            }
                        })
                    }
                    // The sole leader was cancelled before finishing; take
                    // over as the next leader.
                    Err(_) => continue,
                },
                Role::Leader(tx) => return self.lead_build(request, fp, inventory, tx).await,
            }
        }
    }

    /// Run the provider chain in a detached task so waiters survive leader
    /// cancellation; abort it only when nobody else is waiting.
    async fn lead_build(
        &self,
        request: PairingRequest,
        fp: String,
        inventory: Vec<StockView>,
        tx: broadcast::Sender<SharedOutcome>,
    ) -> CoreResult<Arc<PairingResult>> {
        let task = tokio::spawn({
            let inner = self.inner.clone();
            let fp = fp.clone();
            let tx = tx.clone();
            async move {
                let outcome = inner.build(&request, &fp, &inventory).await;
                inner.inflight.lock().remove(&fp);
                let shared = match &outcome {
                    Ok(result) => Ok(result.clone()),
                    Err(e) => Err(e.code().to_string()),
                };
                let _ = tx.send(shared);
                outcome
            }
        });

        let mut guard = LeaderGuard {
            fp,
            tx,
            abort: task.abort_handle(),
            inner: self.inner.clone(),
            finished: false,
        };

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                if join_error.is_cancelled() {
                    Err(CoreError::Cancelled("pairing build aborted".to_string()))
                } else {
                    Err(CoreError::Storage(format!("pairing task: {join_error}")))
                }
            }
        };
        guard.finished = true;
        outcome
    }

    /// Record guest feedback and fold the overall rating into the experiment
    /// arm that produced the recommendation.
    pub fn record_feedback(&self, feedback: &PairingFeedback) -> CoreResult<()> {
        self.inner.record_feedback(feedback)
    }

    pub fn experiment_summary(&self) -> crate::pairing::experiment::ExperimentSummary {
        self.inner.allocator.lock().summary()
    }

    pub fn cache_len(&self) -> usize {
        self.inner.cache.len()
    }
}

impl Inner {
    async fn build(
        &self,
        request: &PairingRequest,
        fp: &str,
        inventory: &[StockView],
    ) -> CoreResult<Arc<PairingResult>> {
        let started = Instant::now();
        self.metrics.record_cache_miss();

        let variant = {
            let mut allocator = self.allocator.lock();
            let variant = allocator.get_variant(fp);
            allocator.record_request(variant);
            variant
        };

        let heuristic: Arc<dyn PairingProvider> = Arc::new(HeuristicEngine::new(variant.weights()));
        let chain: Vec<(Arc<dyn PairingProvider>, Duration)> = self
            .ai_providers
            .iter()
            .cloned()
            .map(|provider| (provider, self.provider_timeout))
            .chain(std::iter::once((heuristic, HEURISTIC_TIMEOUT)))
            .collect();

        for (provider, timeout) in chain {
            let kind = provider.kind();
            self.metrics.record_provider_attempt(kind.as_str());
            let attempt_started = Instant::now();

            let attempt =
                tokio::time::timeout(timeout, provider.recommend(request, inventory)).await;
            let selections = match attempt {
                Ok(Ok(selections)) => selections,
                Ok(Err(e)) => {
                    self.metrics
                        .record_provider_failure(kind.as_str(), &e.to_string());
                    warn!(provider = kind.as_str(), error = %e, "🍽️ Provider failed, falling through");
                    continue;
                }
                Err(_) => {
                    self.metrics
                        .record_provider_failure(kind.as_str(), "deadline exceeded");
                    warn!(provider = kind.as_str(), "⏱️ Provider deadline exceeded");
                    continue;
                }
            };

            let sanitized = self.sanitize(selections, request.options.max_recommendations)?;
            if sanitized.is_empty() {
                self.metrics
                    .record_provider_failure(kind.as_str(), "no available selections");
                continue;
            }

            self.metrics.record_provider_success(
                kind.as_str(),
                attempt_started.elapsed().as_millis() as u64,
            );

            let result = Arc::new(PairingResult {
                recommendation_id: Uuid::new_v4().to_string(),
                fingerprint: fp.to_string(),
                provider: kind,
                selections: sanitized,
                from_cache: false,
            });
            self.persist(request, &result)?;
            self.cache.insert(fp.to_string(), result.clone());

            let elapsed_ms = started.elapsed().as_millis() as f64;
            let top_confidence = result.selections.first().map(|s| s.confidence).unwrap_or(0.0);
            self.metrics.record_pairing_success(elapsed_ms, top_confidence);
            info!(
                provider = kind.as_str(),
                selections = result.selections.len(),
                elapsed_ms = elapsed_ms as u64,
                "🍷 Pairing produced"
            );
            return Ok(result);
        }

        self.metrics.record_pairing_failure();
        Err(CoreError::PairingFailed)
    }

    /// Drop unavailable or duplicate vintages, clamp confidences to [0, 1],
    /// sort descending, truncate.
    fn sanitize(
        &self,
        selections: Vec<WineSelection>,
        max: usize,
    ) -> CoreResult<Vec<WineSelection>> {
        let available = self.available_ids()?;
        let mut seen = HashSet::new();
        let mut sanitized: Vec<WineSelection> = selections
            .into_iter()
            .filter(|s| available.contains(&s.vintage_id) && seen.insert(s.vintage_id))
            .map(|mut s| {
                s.confidence = s.confidence.clamp(0.0, 1.0);
                s
            })
            .collect();
        sanitized.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sanitized.truncate(max);
        Ok(sanitized)
    }

    fn available_inventory(&self) -> CoreResult<Vec<StockView>> {
        self.inventory.get_stock(&StockFilters {
            available_only: true,
            limit: 500,
            ..Default::default()
        })
    }

    fn available_ids(&self) -> CoreResult<HashSet<i64>> {
        Ok(self
            .available_inventory()?
            .iter()
            .map(|view| view.vintage_id)
            .collect())
    }

    fn persist(&self, request: &PairingRequest, result: &PairingResult) -> CoreResult<()> {
        let context_json = serde_json::to_string(&request.context)
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        let selections_json = serde_json::to_string(&result.selections)
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        self.store.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO pairing_recommendations \
                    (id, fingerprint, dish, context_json, selections_json, provider, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    result.recommendation_id,
                    result.fingerprint,
                    request.dish,
                    context_json,
                    selections_json,
                    result.provider.as_str(),
                    Utc::now().timestamp(),
                ],
            )?;
            Ok(())
        })
    }

    fn record_feedback(&self, feedback: &PairingFeedback) -> CoreResult<()> {
        for (name, value) in [
            ("overall", feedback.overall),
            ("flavor_harmony", feedback.flavor_harmony),
            ("texture_balance", feedback.texture_balance),
            ("acidity_match", feedback.acidity_match),
            ("tannin_balance", feedback.tannin_balance),
            ("body_match", feedback.body_match),
            ("regional_tradition", feedback.regional_tradition),
        ] {
            if let Some(rating) = value {
                if !(1..=5).contains(&rating) {
                    return Err(CoreError::invalid(format!(
                        "rating '{name}' must be within 1..=5"
                    )));
                }
            }
        }

        let fingerprint: Option<String> = self.store.read(|conn| {
            Ok(conn
                .prepare_cached("SELECT fingerprint FROM pairing_recommendations WHERE id = ?1")?
                .query_row(params![feedback.recommendation_id], |row| row.get(0))
                .optional()?)
        })?;
        let fingerprint = fingerprint.ok_or_else(|| {
            CoreError::not_found(format!("recommendation {}", feedback.recommendation_id))
        })?;

        self.store.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO pairing_feedback \
                    (recommendation_id, rating_overall, rating_flavor_harmony, \
                     rating_texture_balance, rating_acidity_match, rating_tannin_balance, \
                     rating_body_match, rating_regional_tradition, selected, \
                     time_to_select_ms, notes) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    feedback.recommendation_id,
                    feedback.overall,
                    feedback.flavor_harmony,
                    feedback.texture_balance,
                    feedback.acidity_match,
                    feedback.tannin_balance,
                    feedback.body_match,
                    feedback.regional_tradition,
                    feedback.selected,
                    feedback.time_to_select_ms,
                    feedback.notes,
                ],
            )?;
            Ok(())
        })?;

        if let Some(overall) = feedback.overall {
            let mut allocator = self.allocator.lock();
            let variant = allocator
                .variant_for(&fingerprint)
                .unwrap_or(PairingVariant::Control);
            allocator.record_outcome(variant, overall as f64);
        }
        debug!(
            recommendation_id = %feedback.recommendation_id,
            "💬 Pairing feedback stored"
        );
        Ok(())
    }
}

/// Abort-on-drop guard for the leading caller. Dropped mid-build with no
/// other waiters, it cancels the detached task and frees the slot.
struct LeaderGuard {
    fp: String,
    tx: broadcast::Sender<SharedOutcome>,
    abort: AbortHandle,
    inner: Arc<Inner>,
    finished: bool,
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.tx.receiver_count() == 0 {
            self.abort.abort();
            self.inner.inflight.lock().remove(&self.fp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::events::NullSink;
    use crate::pairing::{ExperimentConfig, PairingContext, PairingOptions};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixture(
        ai_providers: Vec<Arc<dyn PairingProvider>>,
    ) -> (
        tempfile::TempDir,
        PairingOrchestrator,
        Arc<InventoryManager>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairing.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        store
            .with_transaction(|conn| {
                conn.execute(
                    "INSERT INTO wines (id, name, producer, region, country, wine_type, updated_at) \
                     VALUES (1, 'Chablis Grand Cru', 'William Fèvre', 'Chablis', 'France', 'white', 0), \
                            (2, 'Hermitage', 'Jean-Louis Chave', 'Rhône', 'France', 'red', 0)",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO vintages (id, wine_id, year, updated_at) \
                     VALUES (11, 1, 2019, 0), (22, 2, 2016, 0)",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO stock (vintage_id, location, quantity, updated_at) \
                     VALUES (11, 'main-cellar', 6, 0), (22, 'main-cellar', 4, 0)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let metrics = Arc::new(MetricsTracker::new(100));
        let inventory = Arc::new(InventoryManager::new(
            store.clone(),
            Arc::new(NullSink),
            metrics.clone(),
        ));
        let orchestrator = PairingOrchestrator::new(
            store,
            inventory.clone(),
            metrics,
            ai_providers,
            ExperimentAllocator::new(ExperimentConfig::default()),
            100,
            Duration::from_secs(900),
            Duration::from_millis(200),
        );
        (dir, orchestrator, inventory)
    }

    fn request(dish: &str) -> PairingRequest {
        PairingRequest {
            dish: dish.to_string(),
            context: PairingContext {
                occasion: Some("casual-dining".into()),
                guest_count: Some(4),
                ..Default::default()
            },
            preferences: String::new(),
            options: PairingOptions {
                max_recommendations: 3,
                include_reasoning: true,
            },
        }
    }

    struct FailingProvider {
        kind: ProviderKind,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PairingProvider for FailingProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn recommend(
            &self,
            _request: &PairingRequest,
            _inventory: &[StockView],
        ) -> CoreResult<Vec<WineSelection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::ProviderError("upstream 500".to_string()))
        }
    }

    struct SlowProvider {
        kind: ProviderKind,
    }

    #[async_trait]
    impl PairingProvider for SlowProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn recommend(
            &self,
            _request: &PairingRequest,
            _inventory: &[StockView],
        ) -> CoreResult<Vec<WineSelection>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            unreachable!("deadline should fire first")
        }
    }

    struct CountingProvider {
        kind: ProviderKind,
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl PairingProvider for CountingProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn recommend(
            &self,
            _request: &PairingRequest,
            _inventory: &[StockView],
        ) -> CoreResult<Vec<WineSelection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(vec![WineSelection {
                vintage_id: 11,
                confidence: 0.9,
                reasoning: None,
            }])
        }
    }

    #[tokio::test]
    async fn falls_back_to_heuristic() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_dir, orchestrator, _) = fixture(vec![Arc::new(FailingProvider {
            kind: ProviderKind::PrimaryAi,
            calls: calls.clone(),
        })]);

        let result = orchestrator.recommend(request("grilled salmon")).await.unwrap();
        assert_eq!(result.provider, ProviderKind::Heuristic);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!result.selections.is_empty());
        for pair in result.selections.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
    }

    #[tokio::test]
    async fn timeout_falls_through() {
        let (_dir, orchestrator, _) = fixture(vec![Arc::new(SlowProvider {
            kind: ProviderKind::PrimaryAi,
        })]);
        let result = orchestrator.recommend(request("oysters")).await.unwrap();
        assert_eq!(result.provider, ProviderKind::Heuristic);
    }

    #[tokio::test]
    async fn second_identical_request_hits_cache() {
        let (_dir, orchestrator, _) = fixture(Vec::new());

        let first = orchestrator.recommend(request("grilled salmon")).await.unwrap();
        assert!(!first.from_cache);

        let second = orchestrator.recommend(request("grilled salmon")).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(first.recommendation_id, second.recommendation_id);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_share_one_build() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_dir, orchestrator, _) = fixture(vec![Arc::new(CountingProvider {
            kind: ProviderKind::PrimaryAi,
            calls: calls.clone(),
            delay: Duration::from_millis(50),
        })]);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let orchestrator = orchestrator.clone();
            handles.push(tokio::spawn(async move {
                orchestrator.recommend(request("grilled salmon")).await
            }));
        }
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.selections[0].vintage_id, 11);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "single provider call shared");
    }

    #[tokio::test]
    async fn sold_out_vintage_never_returned() {
        let (_dir, orchestrator, inventory) = fixture(Vec::new());

        let first = orchestrator.recommend(request("grilled salmon")).await.unwrap();
        assert!(first.selections.iter().any(|s| s.vintage_id == 11));

        // Drink the cellar dry of vintage 11, then ask again within the TTL.
        inventory.consume(11, "main-cellar", 6, None, "service").unwrap();
        let second = orchestrator.recommend(request("grilled salmon")).await.unwrap();
        assert!(second.selections.iter().all(|s| s.vintage_id != 11));
    }

    #[tokio::test]
    async fn empty_dish_invalid() {
        let (_dir, orchestrator, _) = fixture(Vec::new());
        let result = orchestrator.recommend(request("   ")).await;
        assert!(matches!(result, Err(CoreError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn all_providers_down_and_no_stock_fails() {
        let (_dir, orchestrator, inventory) = fixture(Vec::new());
        inventory.consume(11, "main-cellar", 6, None, "x").unwrap();
        inventory.consume(22, "main-cellar", 4, None, "x").unwrap();

        let result = orchestrator.recommend(request("anything")).await;
        assert!(matches!(result, Err(CoreError::PairingFailed)));
    }

    #[tokio::test]
    async fn feedback_requires_known_recommendation() {
        let (_dir, orchestrator, _) = fixture(Vec::new());
        let feedback = PairingFeedback {
            recommendation_id: "missing".to_string(),
            overall: Some(4),
            flavor_harmony: None,
            texture_balance: None,
            acidity_match: None,
            tannin_balance: None,
            body_match: None,
            regional_tradition: None,
            selected: Some(true),
            time_to_select_ms: Some(1200),
            notes: None,
        };
        assert!(matches!(
            orchestrator.record_feedback(&feedback),
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn feedback_roundtrip_with_rating_bounds() {
        let (_dir, orchestrator, _) = fixture(Vec::new());
        let result = orchestrator.recommend(request("duck breast")).await.unwrap();

        let mut feedback = PairingFeedback {
            recommendation_id: result.recommendation_id.clone(),
            overall: Some(6),
            flavor_harmony: None,
            texture_balance: None,
            acidity_match: None,
            tannin_balance: None,
            body_match: None,
            regional_tradition: None,
            selected: None,
            time_to_select_ms: None,
            notes: None,
        };
        assert!(matches!(
            orchestrator.record_feedback(&feedback),
            Err(CoreError::InvalidArgument(_))
        ));

        feedback.overall = Some(5);
        orchestrator.record_feedback(&feedback).unwrap();
    }
}
