//! Open-Meteo clients: historical daily archive plus the geocoding fallback
//! used when a region is missing from the built-in table.

use crate::error::{CoreError, CoreResult};
use crate::weather::scores::DailyWeather;
use chrono::NaiveDate;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const GEOCODING_URL: &str = "https://geocoding-api.open-meteo.com/v1/search";

#[derive(Clone)]
pub struct OpenMeteoClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl OpenMeteoClient {
    pub fn new(http: reqwest::Client, base_url: String, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Best-match coordinates for a free-form place name.
    pub async fn geocode(&self, name: &str) -> CoreResult<(f64, f64)> {
        let resp = self
            .http
            .get(GEOCODING_URL)
            .query(&[("name", name), ("count", "1")])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::ProviderError(format!(
                "geocoding {}: {}",
                status.as_u16(),
                name
            )));
        }
        let parsed: GeocodingResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::ProviderError(format!("geocoding json: {e}")))?;
        parsed
            .results
            .and_then(|results| results.into_iter().next())
            .map(|hit| (hit.latitude, hit.longitude))
            .ok_or_else(|| CoreError::ProviderError(format!("geocoding: no match for '{name}'")))
    }

    /// Daily observations for the window, inclusive.
    pub async fn fetch_daily(
        &self,
        latitude: f64,
        longitude: f64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> CoreResult<Vec<DailyWeather>> {
        let url = format!("{}/v1/archive", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("latitude", latitude.to_string()),
                ("longitude", longitude.to_string()),
                ("start_date", start.format("%Y-%m-%d").to_string()),
                ("end_date", end.format("%Y-%m-%d").to_string()),
                (
                    "daily",
                    "temperature_2m_max,temperature_2m_min,temperature_2m_mean,precipitation_sum"
                        .to_string(),
                ),
                ("timezone", "UTC".to_string()),
            ])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::ProviderError(format!(
                "weather archive {}",
                status.as_u16()
            )));
        }
        let parsed: ArchiveResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::ProviderError(format!("weather archive json: {e}")))?;
        let daily = parsed
            .daily
            .ok_or_else(|| CoreError::ProviderError("weather archive: empty daily block".into()))?;

        let mut days = Vec::with_capacity(daily.time.len());
        for (index, date_text) in daily.time.iter().enumerate() {
            let date = NaiveDate::parse_from_str(date_text, "%Y-%m-%d")
                .map_err(|e| CoreError::ProviderError(format!("weather archive date: {e}")))?;
            // Days with missing temperature are skipped; coverage drops and
            // so does the confidence attached to the derived scores.
            let (Some(max), Some(min)) = (
                daily.temperature_2m_max.get(index).copied().flatten(),
                daily.temperature_2m_min.get(index).copied().flatten(),
            ) else {
                continue;
            };
            let mean = daily
                .temperature_2m_mean
                .get(index)
                .copied()
                .flatten()
                .unwrap_or((max + min) / 2.0);
            days.push(DailyWeather {
                date,
                temp_max: max,
                temp_min: min,
                temp_mean: mean,
                precipitation: daily
                    .precipitation_sum
                    .get(index)
                    .copied()
                    .flatten()
                    .unwrap_or(0.0),
            });
        }
        debug!(
            latitude,
            longitude,
            days = days.len(),
            "🌦️ Historical weather fetched"
        );
        Ok(days)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> CoreError {
    if e.is_timeout() {
        CoreError::ProviderTimeout(format!("weather api: {e}"))
    } else {
        CoreError::ProviderError(format!("weather api: {e}"))
    }
}

#[derive(Debug, Deserialize)]
struct GeocodingResponse {
    results: Option<Vec<GeocodingHit>>,
}

#[derive(Debug, Deserialize)]
struct GeocodingHit {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct ArchiveResponse {
    daily: Option<ArchiveDaily>,
}

#[derive(Debug, Deserialize)]
struct ArchiveDaily {
    time: Vec<String>,
    #[serde(default)]
    temperature_2m_max: Vec<Option<f64>>,
    #[serde(default)]
    temperature_2m_min: Vec<Option<f64>>,
    #[serde(default)]
    temperature_2m_mean: Vec<Option<f64>>,
    #[serde(default)]
    precipitation_sum: Vec<Option<f64>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_response_parses_with_gaps() {
        let body = r#"{
            "daily": {
                "time": ["2019-04-01", "2019-04-02", "2019-04-03"],
                "temperature_2m_max": [15.2, null, 18.0],
                "temperature_2m_min": [4.1, 5.0, 7.2],
                "temperature_2m_mean": [9.6, 10.0, null],
                "precipitation_sum": [0.0, 2.4, null]
            }
        }"#;
        let parsed: ArchiveResponse = serde_json::from_str(body).unwrap();
        let daily = parsed.daily.unwrap();
        assert_eq!(daily.time.len(), 3);
        assert_eq!(daily.temperature_2m_max[1], None);
    }
}
