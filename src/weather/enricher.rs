//! Vintage weather enrichment.
//!
//! Resolves a region to coordinates, pulls the growing-season history,
//! derives scores, and persists a WeatherVintage row plus the vintage's
//! `weather_score` and procurement narrative. Best-effort by contract:
//! failures never block inventory operations.

use crate::db::Store;
use crate::error::{CoreError, CoreResult};
use crate::pairing::ChatCompletionProvider;
use crate::weather::open_meteo::OpenMeteoClient;
use crate::weather::regions::{self, REFERENCE_REGION};
use crate::weather::scores::{
    self, coverage, derive_scores, growing_season, season_metrics, SeasonMetrics, WeatherScores,
};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Entries at or above this confidence are immutable once written.
const IMMUTABLE_CONFIDENCE: f64 = 0.8;

const BATCH_GROUP_SIZE: usize = 5;
const BATCH_GROUP_SPACING: Duration = Duration::from_secs(1);

/// Cached meteorological derivation for one (region, year).
#[derive(Debug, Clone, Serialize)]
pub struct WeatherVintage {
    pub region_normalized: String,
    pub year: i32,
    pub gdd: f64,
    pub huglin_index: f64,
    pub diurnal_range: f64,
    pub heatwave_days: u32,
    pub frost_days: u32,
    pub precipitation_total: f64,
    pub wet_days: u32,
    pub ripeness_score: f64,
    pub acidity_score: f64,
    pub tannin_score: f64,
    pub disease_score: f64,
    pub overall_score: f64,
    pub confidence: f64,
    pub narrative: Option<String>,
    pub retrieved_at: i64,
}

/// How coordinates were found; sets the source half of the confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordinateSource {
    BuiltinTable,
    Geocoded,
    CountryCenter,
    ReferenceRegion,
    OfflineTemplate,
}

impl CoordinateSource {
    fn confidence_factor(&self) -> f64 {
        match self {
            CoordinateSource::BuiltinTable => 1.0,
            CoordinateSource::Geocoded => 0.9,
            CoordinateSource::CountryCenter => 0.7,
            CoordinateSource::ReferenceRegion => 0.55,
            CoordinateSource::OfflineTemplate => 0.2,
        }
    }
}

pub struct WeatherEnricher {
    store: Store,
    client: OpenMeteoClient,
    narrative_ai: Option<ChatCompletionProvider>,
    external_calls_disabled: bool,
    memory_cache: Mutex<HashMap<(String, i32), WeatherVintage>>,
}

impl WeatherEnricher {
    pub fn new(
        store: Store,
        client: OpenMeteoClient,
        narrative_ai: Option<ChatCompletionProvider>,
        external_calls_disabled: bool,
    ) -> Self {
        Self {
            store,
            client,
            narrative_ai,
            external_calls_disabled,
            memory_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Produce (or load) the WeatherVintage for a region and year, and push
    /// the derived score onto every matching vintage row.
    pub async fn enrich(&self, region: &str, year: i32) -> CoreResult<WeatherVintage> {
        if !crate::models::vintage_year_valid(year) {
            return Err(CoreError::invalid(format!("vintage year {year}")));
        }
        let key = regions::normalize_region(region);
        if key.is_empty() {
            return Err(CoreError::invalid("region must not be empty"));
        }

        if let Some(cached) = self.memory_cache.lock().get(&(key.clone(), year)).cloned() {
            return Ok(cached);
        }
        if let Some(stored) = self.load(&key, year)? {
            self.memory_cache
                .lock()
                .insert((key.clone(), year), stored.clone());
            return Ok(stored);
        }

        let record = self.compute(&key, region, year).await?;
        self.persist(&record)?;
        self.apply_to_vintages(&record)?;
        self.memory_cache
            .lock()
            .insert((key, year), record.clone());
        info!(
            region = %record.region_normalized,
            year,
            score = record.overall_score,
            confidence = record.confidence,
            "🌤️ Vintage weather enriched"
        );
        Ok(record)
    }

    /// Recompute a stored entry if its confidence still permits it. High
    /// confidence entries are immutable and returned as-is.
    pub async fn refresh(&self, region: &str, year: i32) -> CoreResult<WeatherVintage> {
        let key = regions::normalize_region(region);
        if let Some(stored) = self.load(&key, year)? {
            if stored.confidence >= IMMUTABLE_CONFIDENCE {
                return Ok(stored);
            }
        }
        self.memory_cache.lock().remove(&(key.clone(), year));
        let record = self.compute(&key, region, year).await?;
        self.persist(&record)?;
        self.apply_to_vintages(&record)?;
        self.memory_cache
            .lock()
            .insert((key, year), record.clone());
        Ok(record)
    }

    /// Enrich many (region, year) pairs in groups of five with one-second
    /// spacing between groups, respecting upstream rate limits. Individual
    /// failures are logged and skipped.
    pub async fn enrich_batch(&self, items: &[(String, i32)]) -> usize {
        let mut enriched = 0usize;
        for (group_index, group) in items.chunks(BATCH_GROUP_SIZE).enumerate() {
            if group_index > 0 {
                tokio::time::sleep(BATCH_GROUP_SPACING).await;
            }
            for (region, year) in group {
                match self.enrich(region, *year).await {
                    Ok(_) => enriched += 1,
                    Err(e) => {
                        warn!(region = %region, year, error = %e, "weather enrichment skipped");
                    }
                }
            }
        }
        enriched
    }

    /// All vintages without a weather score, as (region, year) work items.
    pub fn missing_enrichment(&self) -> CoreResult<Vec<(String, i32)>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT w.region, v.year FROM vintages v \
                 JOIN wines w ON w.id = v.wine_id \
                 WHERE v.weather_score IS NULL AND w.region <> '' \
                 ORDER BY v.year DESC LIMIT 200",
            )?;
            let rows: Vec<(String, i32)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<_, _>>()?;
            Ok(rows)
        })
    }

    /// Stored analysis for every vintage of a wine, if present.
    pub fn analysis_for_wine(&self, wine_id: i64) -> CoreResult<Vec<WeatherVintage>> {
        let pairs: Vec<(String, i32)> = self.store.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT w.region, v.year FROM vintages v \
                 JOIN wines w ON w.id = v.wine_id WHERE w.id = ?1",
            )?;
            let rows: Vec<(String, i32)> = stmt
                .query_map(params![wine_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<_, _>>()?;
            Ok(rows)
        })?;
        if pairs.is_empty() {
            return Err(CoreError::not_found(format!("wine {wine_id}")));
        }

        let mut records = Vec::new();
        for (region, year) in pairs {
            if let Some(record) = self.load(&regions::normalize_region(&region), year)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn compute(&self, key: &str, raw_region: &str, year: i32) -> CoreResult<WeatherVintage> {
        let (latitude, longitude, source) = self.resolve_coordinates(raw_region).await;

        let (start, end) = growing_season(year, latitude);
        let (days, source) = if self.external_calls_disabled {
            (
                scores::synthetic_season(key, year, latitude),
                CoordinateSource::OfflineTemplate,
            )
        } else {
            match self.client.fetch_daily(latitude, longitude, start, end).await {
                Ok(days) => (days, source),
                Err(e) => {
                    warn!(region = %key, year, error = %e, "weather fetch failed, using template season");
                    (
                        scores::synthetic_season(key, year, latitude),
                        CoordinateSource::OfflineTemplate,
                    )
                }
            }
        };

        if days.is_empty() {
            return Err(CoreError::ProviderError(format!(
                "no observations for {key} {year}"
            )));
        }

        let metrics = season_metrics(&days, latitude);
        let derived = derive_scores(&metrics);
        let confidence =
            (coverage(&metrics, start, end) * source.confidence_factor()).clamp(0.0, 1.0);
        let narrative = self.narrative(key, year, &metrics, &derived).await;

        Ok(WeatherVintage {
            region_normalized: key.to_string(),
            year,
            gdd: metrics.gdd,
            huglin_index: metrics.huglin_index,
            diurnal_range: metrics.diurnal_range,
            heatwave_days: metrics.heatwave_days,
            frost_days: metrics.frost_days,
            precipitation_total: metrics.precipitation_total,
            wet_days: metrics.wet_days,
            ripeness_score: derived.ripeness,
            acidity_score: derived.acidity,
            tannin_score: derived.tannin,
            disease_score: derived.disease,
            overall_score: derived.overall,
            confidence,
            narrative: Some(narrative),
            retrieved_at: Utc::now().timestamp(),
        })
    }

    async fn resolve_coordinates(&self, region: &str) -> (f64, f64, CoordinateSource) {
        if let Some(info) = regions::lookup(region) {
            return (info.latitude, info.longitude, CoordinateSource::BuiltinTable);
        }
        if !self.external_calls_disabled {
            match self.client.geocode(region).await {
                Ok((lat, lon)) => return (lat, lon, CoordinateSource::Geocoded),
                Err(e) => debug!(region, error = %e, "geocoding fallback failed"),
            }
        }
        if let Some((lat, lon)) = regions::country_center(region) {
            return (lat, lon, CoordinateSource::CountryCenter);
        }
        (
            REFERENCE_REGION.latitude,
            REFERENCE_REGION.longitude,
            CoordinateSource::ReferenceRegion,
        )
    }

    async fn narrative(
        &self,
        region: &str,
        year: i32,
        metrics: &SeasonMetrics,
        derived: &WeatherScores,
    ) -> String {
        if let (Some(ai), false) = (&self.narrative_ai, self.external_calls_disabled) {
            let prompt = format!(
                "Write a two-sentence vintage summary for {region} {year}. \
                 Season data: {:.0} growing degree days, {:.1}C average diurnal range, \
                 {} days above 35C, {} frost days, {:.0}mm total rain across {} wet days. \
                 Overall score {:.0}/100.",
                metrics.gdd,
                metrics.diurnal_range,
                metrics.heatwave_days,
                metrics.frost_days,
                metrics.precipitation_total,
                metrics.wet_days,
                derived.overall,
            );
            let attempt = tokio::time::timeout(
                Duration::from_secs(10),
                ai.chat_completion(
                    "You are a viticulture analyst. Reply with the summary only.",
                    &prompt,
                ),
            )
            .await;
            match attempt {
                Ok(Ok(text)) if !text.trim().is_empty() => return text.trim().to_string(),
                Ok(Ok(_)) => debug!("narrative provider returned empty text, using template"),
                Ok(Err(e)) => debug!(error = %e, "narrative provider failed, using template"),
                Err(_) => debug!("narrative provider deadline exceeded, using template"),
            }
        }
        template_narrative(region, year, metrics, derived)
    }

    fn load(&self, key: &str, year: i32) -> CoreResult<Option<WeatherVintage>> {
        self.store.read(|conn| {
            let record = conn
                .prepare_cached(
                    "SELECT gdd, huglin_index, diurnal_range, heatwave_days, frost_days, \
                            precipitation_total, wet_days, ripeness_score, acidity_score, \
                            tannin_score, disease_score, overall_score, confidence, narrative, \
                            retrieved_at \
                     FROM weather_vintage WHERE region_normalized = ?1 AND year = ?2",
                )?
                .query_row(params![key, year], |row| {
                    Ok(WeatherVintage {
                        region_normalized: key.to_string(),
                        year,
                        gdd: row.get(0)?,
                        huglin_index: row.get(1)?,
                        diurnal_range: row.get(2)?,
                        heatwave_days: row.get::<_, i64>(3)? as u32,
                        frost_days: row.get::<_, i64>(4)? as u32,
                        precipitation_total: row.get(5)?,
                        wet_days: row.get::<_, i64>(6)? as u32,
                        ripeness_score: row.get(7)?,
                        acidity_score: row.get(8)?,
                        tannin_score: row.get(9)?,
                        disease_score: row.get(10)?,
                        overall_score: row.get(11)?,
                        confidence: row.get(12)?,
                        narrative: row.get(13)?,
                        retrieved_at: row.get(14)?,
                    })
                })
                .optional()?;
            Ok(record)
        })
    }

    fn persist(&self, record: &WeatherVintage) -> CoreResult<()> {
        self.store.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO weather_vintage \
                    (region_normalized, year, gdd, huglin_index, diurnal_range, heatwave_days, \
                     frost_days, precipitation_total, wet_days, ripeness_score, acidity_score, \
                     tannin_score, disease_score, overall_score, confidence, narrative, \
                     retrieved_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17) \
                 ON CONFLICT(region_normalized, year) DO UPDATE SET \
                    gdd=excluded.gdd, huglin_index=excluded.huglin_index, \
                    diurnal_range=excluded.diurnal_range, heatwave_days=excluded.heatwave_days, \
                    frost_days=excluded.frost_days, \
                    precipitation_total=excluded.precipitation_total, \
                    wet_days=excluded.wet_days, ripeness_score=excluded.ripeness_score, \
                    acidity_score=excluded.acidity_score, tannin_score=excluded.tannin_score, \
                    disease_score=excluded.disease_score, overall_score=excluded.overall_score, \
                    confidence=excluded.confidence, narrative=excluded.narrative, \
                    retrieved_at=excluded.retrieved_at",
                params![
                    record.region_normalized,
                    record.year,
                    record.gdd,
                    record.huglin_index,
                    record.diurnal_range,
                    record.heatwave_days as i64,
                    record.frost_days as i64,
                    record.precipitation_total,
                    record.wet_days as i64,
                    record.ripeness_score,
                    record.acidity_score,
                    record.tannin_score,
                    record.disease_score,
                    record.overall_score,
                    record.confidence,
                    record.narrative,
                    record.retrieved_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Push the derived score and production notes onto every vintage whose
    /// wine sits in this region.
    fn apply_to_vintages(&self, record: &WeatherVintage) -> CoreResult<()> {
        let notes = production_notes(record);
        let notes_json =
            serde_json::to_string(&notes).map_err(|e| CoreError::Storage(e.to_string()))?;
        self.store.with_transaction(|conn| {
            let updated = conn.execute(
                "UPDATE vintages SET weather_score = ?1, production_notes = ?2, \
                        updated_at = strftime('%s', 'now'), updated_by = 'weather-enricher' \
                 WHERE year = ?3 AND wine_id IN \
                       (SELECT id FROM wines WHERE LOWER(region) LIKE '%' || ?4 || '%')",
                params![
                    record.overall_score,
                    notes_json,
                    record.year,
                    record.region_normalized,
                ],
            )?;
            debug!(
                region = %record.region_normalized,
                year = record.year,
                vintages = updated,
                "weather score applied"
            );
            Ok(())
        })
    }
}

/// Tagged production-notes record stored on the vintage (opaque blob at the
/// persistence layer, structured at the API boundary).
#[derive(Debug, Clone, Serialize)]
pub struct ProductionNotes {
    pub narrative: String,
    pub procurement: ProcurementAdvice,
    pub weather_summary: WeatherSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcurementAdvice {
    pub action: &'static str,
    pub priority: &'static str,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeatherSummary {
    pub gdd: f64,
    pub diurnal_range: f64,
    pub heatwave_days: u32,
    pub frost_days: u32,
    pub precipitation_total: f64,
    pub overall_score: f64,
    pub confidence: f64,
}

fn production_notes(record: &WeatherVintage) -> ProductionNotes {
    let (action, priority, reasoning) = if record.overall_score >= 85.0 {
        (
            "buy",
            "high",
            format!(
                "Exceptional season ({:.0}/100); allocations will move quickly",
                record.overall_score
            ),
        )
    } else if record.overall_score >= 65.0 {
        (
            "hold",
            "normal",
            format!("Solid season ({:.0}/100); buy on price", record.overall_score),
        )
    } else {
        (
            "avoid",
            "low",
            format!(
                "Difficult season ({:.0}/100); be selective by producer",
                record.overall_score
            ),
        )
    };

    ProductionNotes {
        narrative: record.narrative.clone().unwrap_or_default(),
        procurement: ProcurementAdvice {
            action,
            priority,
            reasoning,
        },
        weather_summary: WeatherSummary {
            gdd: record.gdd,
            diurnal_range: record.diurnal_range,
            heatwave_days: record.heatwave_days,
            frost_days: record.frost_days,
            precipitation_total: record.precipitation_total,
            overall_score: record.overall_score,
            confidence: record.confidence,
        },
    }
}

fn template_narrative(
    region: &str,
    year: i32,
    metrics: &SeasonMetrics,
    derived: &WeatherScores,
) -> String {
    let character = if derived.overall >= 85.0 {
        "an exceptional growing season"
    } else if derived.overall >= 65.0 {
        "a strong growing season"
    } else if derived.overall >= 45.0 {
        "a mixed growing season"
    } else {
        "a challenging growing season"
    };
    let heat = if metrics.heatwave_days > 10 {
        " marked by repeated heat spikes"
    } else if metrics.gdd < 1000.0 {
        " on the cool side"
    } else {
        ""
    };
    let rain = if metrics.precipitation_total > 500.0 {
        format!(
            ", with {:.0}mm of rain raising disease pressure",
            metrics.precipitation_total
        )
    } else {
        String::new()
    };
    format!(
        "{} {} saw {character}{heat}{rain}. {:.0} growing degree days and an average \
         diurnal swing of {:.1}C point to ripeness {:.1}/5 with acidity {:.1}/5.",
        title_case(region),
        year,
        metrics.gdd,
        metrics.diurnal_range,
        derived.ripeness,
        derived.acidity,
    )
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fixture() -> (tempfile::TempDir, WeatherEnricher, Store) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weather.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        store
            .with_transaction(|conn| {
                conn.execute(
                    "INSERT INTO wines (id, name, producer, region, country, wine_type, updated_at) \
                     VALUES (1, 'Margaux', 'Château Margaux', 'Bordeaux', 'France', 'red', 0)",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO vintages (id, wine_id, year, updated_at) VALUES (42, 1, 2015, 0)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let client = OpenMeteoClient::new(
            reqwest::Client::new(),
            "https://archive-api.open-meteo.com".to_string(),
            Duration::from_millis(100),
        );
        // Offline mode: the synthetic season generator stands in for the API.
        let enricher = WeatherEnricher::new(store.clone(), client, None, true);
        (dir, enricher, store)
    }

    #[tokio::test]
    async fn enrich_persists_and_updates_vintage() {
        let (_dir, enricher, store) = fixture();
        let record = enricher.enrich("Bordeaux", 2015).await.unwrap();
        assert_eq!(record.region_normalized, "bordeaux");
        assert!((0.0..=100.0).contains(&record.overall_score));
        assert!(record.narrative.is_some());

        let (score, notes): (Option<f64>, Option<String>) = store
            .read(|conn| {
                Ok(conn.query_row(
                    "SELECT weather_score, production_notes FROM vintages WHERE id = 42",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(score, Some(record.overall_score));
        let notes: serde_json::Value = serde_json::from_str(&notes.unwrap()).unwrap();
        assert!(notes.get("procurement").is_some());
        assert!(notes.get("weather_summary").is_some());
    }

    #[tokio::test]
    async fn repeat_enrich_is_stable() {
        let (_dir, enricher, _store) = fixture();
        let first = enricher.enrich("Bordeaux", 2015).await.unwrap();
        let second = enricher.enrich("Bordeaux", 2015).await.unwrap();
        assert_eq!(first.overall_score, second.overall_score);
        assert_eq!(first.retrieved_at, second.retrieved_at, "served from cache");
    }

    #[tokio::test]
    async fn offline_confidence_is_low_and_refreshable() {
        let (_dir, enricher, _store) = fixture();
        let first = enricher.enrich("Bordeaux", 2016).await.unwrap();
        assert!(first.confidence < IMMUTABLE_CONFIDENCE);

        // Low-confidence entries may be recomputed.
        let refreshed = enricher.refresh("Bordeaux", 2016).await.unwrap();
        assert_eq!(refreshed.region_normalized, first.region_normalized);
    }

    #[tokio::test]
    async fn unknown_region_falls_back() {
        let (_dir, enricher, _store) = fixture();
        let record = enricher.enrich("Vallée Imaginaire", 2018).await.unwrap();
        assert!((0.0..=100.0).contains(&record.overall_score));
    }

    #[tokio::test]
    async fn invalid_year_rejected() {
        let (_dir, enricher, _store) = fixture();
        assert!(matches!(
            enricher.enrich("Bordeaux", 1500).await,
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn batch_counts_successes() {
        let (_dir, enricher, _store) = fixture();
        let items = vec![
            ("Bordeaux".to_string(), 2014),
            ("Burgundy".to_string(), 2014),
            ("".to_string(), 2014), // invalid, skipped
        ];
        let enriched = enricher.enrich_batch(&items).await;
        assert_eq!(enriched, 2);
    }

    #[tokio::test]
    async fn missing_enrichment_lists_unscored() {
        let (_dir, enricher, _store) = fixture();
        let missing = enricher.missing_enrichment().unwrap();
        assert_eq!(missing, vec![("Bordeaux".to_string(), 2015)]);

        enricher.enrich("Bordeaux", 2015).await.unwrap();
        let missing = enricher.missing_enrichment().unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn analysis_for_wine() {
        let (_dir, enricher, _store) = fixture();
        enricher.enrich("Bordeaux", 2015).await.unwrap();
        let records = enricher.analysis_for_wine(1).unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(
            enricher.analysis_for_wine(99),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn template_narrative_mentions_region_and_year() {
        let metrics = SeasonMetrics {
            gdd: 1400.0,
            huglin_index: 1600.0,
            diurnal_range: 11.0,
            heatwave_days: 2,
            frost_days: 0,
            precipitation_total: 300.0,
            wet_days: 40,
            observed_days: 214,
        };
        let derived = derive_scores(&metrics);
        let text = template_narrative("bordeaux", 2015, &metrics, &derived);
        assert!(text.contains("Bordeaux"));
        assert!(text.contains("2015"));
    }
}
