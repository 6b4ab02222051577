//! Meteorological derivations for a growing season.
//!
//! Raw daily observations reduce to the classic viticulture metrics (GDD,
//! Huglin index, diurnal range, heat/frost extremes, precipitation) and from
//! there to 1-5 sub-scores and a 0-100 vintage weather score. Everything here
//! is a pure function of its inputs.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// One day of observations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DailyWeather {
    pub date: NaiveDate,
    pub temp_max: f64,
    pub temp_min: f64,
    pub temp_mean: f64,
    pub precipitation: f64,
}

/// Season-level aggregates.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SeasonMetrics {
    pub gdd: f64,
    pub huglin_index: f64,
    pub diurnal_range: f64,
    pub heatwave_days: u32,
    pub frost_days: u32,
    pub precipitation_total: f64,
    pub wet_days: u32,
    pub observed_days: u32,
}

/// 1-5 sub-scores plus the weighted 0-100 overall.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeatherScores {
    pub ripeness: f64,
    pub acidity: f64,
    pub tannin: f64,
    pub disease: f64,
    pub overall: f64,
}

const GDD_BASE_C: f64 = 10.0;
const HEATWAVE_THRESHOLD_C: f64 = 35.0;
const FROST_THRESHOLD_C: f64 = 0.0;
const WET_DAY_THRESHOLD_MM: f64 = 1.0;

/// Day-length weighting for the Huglin index by absolute latitude.
fn huglin_latitude_coefficient(latitude: f64) -> f64 {
    let lat = latitude.abs();
    if lat < 40.0 {
        1.00
    } else if lat < 42.0 {
        1.02
    } else if lat < 44.0 {
        1.03
    } else if lat < 46.0 {
        1.04
    } else if lat < 48.0 {
        1.05
    } else {
        1.06
    }
}

pub fn season_metrics(days: &[DailyWeather], latitude: f64) -> SeasonMetrics {
    let k = huglin_latitude_coefficient(latitude);
    let mut metrics = SeasonMetrics::default();
    let mut diurnal_sum = 0.0;

    for day in days {
        metrics.gdd += (day.temp_mean - GDD_BASE_C).max(0.0);
        metrics.huglin_index +=
            k * ((day.temp_mean - GDD_BASE_C).max(0.0) + (day.temp_max - GDD_BASE_C).max(0.0))
                / 2.0;
        diurnal_sum += day.temp_max - day.temp_min;
        if day.temp_max > HEATWAVE_THRESHOLD_C {
            metrics.heatwave_days += 1;
        }
        if day.temp_min < FROST_THRESHOLD_C {
            metrics.frost_days += 1;
        }
        metrics.precipitation_total += day.precipitation;
        if day.precipitation >= WET_DAY_THRESHOLD_MM {
            metrics.wet_days += 1;
        }
    }

    metrics.observed_days = days.len() as u32;
    if !days.is_empty() {
        metrics.diurnal_range = diurnal_sum / days.len() as f64;
    }
    metrics
}

/// Linear ramp between breakpoints, clamped to the outer scores.
fn ramp(value: f64, points: &[(f64, f64)]) -> f64 {
    let first = points[0];
    if value <= first.0 {
        return first.1;
    }
    for window in points.windows(2) {
        let (x0, y0) = window[0];
        let (x1, y1) = window[1];
        if value <= x1 {
            return y0 + (y1 - y0) * (value - x0) / (x1 - x0);
        }
    }
    points[points.len() - 1].1
}

pub fn derive_scores(metrics: &SeasonMetrics) -> WeatherScores {
    // Ripeness tracks heat accumulation; past ~1900 GDD the fruit overshoots.
    let ripeness = ramp(
        metrics.gdd,
        &[
            (700.0, 1.0),
            (1000.0, 2.5),
            (1300.0, 4.0),
            (1600.0, 5.0),
            (1900.0, 4.0),
            (2300.0, 2.5),
        ],
    );

    // Cool nights preserve acidity: diurnal swing helps, raw heat hurts.
    let diurnal_component = ramp(
        metrics.diurnal_range,
        &[(6.0, 2.0), (9.0, 3.0), (12.0, 4.5), (15.0, 5.0)],
    );
    let heat_penalty = ramp(metrics.gdd, &[(1200.0, 0.0), (1800.0, 1.0), (2200.0, 2.0)]);
    let acidity = (diurnal_component - heat_penalty).clamp(1.0, 5.0);

    // Tannin development wants warmth without scorch.
    let tannin_base = ramp(
        metrics.gdd,
        &[(800.0, 1.5), (1200.0, 3.0), (1500.0, 4.5), (1800.0, 5.0)],
    );
    let scorch_penalty = ramp(
        metrics.heatwave_days as f64,
        &[(5.0, 0.0), (15.0, 1.0), (30.0, 2.0)],
    );
    let tannin = (tannin_base - scorch_penalty).clamp(1.0, 5.0);

    // Disease score is protection from pressure: drier seasons score higher.
    let rain_component = ramp(
        metrics.precipitation_total,
        &[(150.0, 5.0), (300.0, 4.0), (500.0, 2.5), (800.0, 1.0)],
    );
    let wet_day_penalty = ramp(
        metrics.wet_days as f64,
        &[(30.0, 0.0), (60.0, 1.0), (90.0, 2.0)],
    );
    let disease = (rain_component - wet_day_penalty).clamp(1.0, 5.0);

    let weighted = 0.35 * ripeness + 0.25 * acidity + 0.20 * tannin + 0.20 * disease;
    let mut overall = (weighted - 1.0) / 4.0 * 100.0;

    // Frost events cap the vintage regardless of the rest of the season.
    if metrics.frost_days > 10 {
        overall -= 15.0;
    } else if metrics.frost_days > 3 {
        overall -= 7.0;
    }

    WeatherScores {
        ripeness,
        acidity,
        tannin,
        disease,
        overall: overall.clamp(0.0, 100.0),
    }
}

/// Growing-season date window for a vintage year: April-October in the
/// northern hemisphere, mirrored (October of the prior year through April)
/// in the southern.
pub fn growing_season(year: i32, latitude: f64) -> (NaiveDate, NaiveDate) {
    if latitude >= 0.0 {
        (
            NaiveDate::from_ymd_opt(year, 4, 1).expect("valid date"),
            NaiveDate::from_ymd_opt(year, 10, 31).expect("valid date"),
        )
    } else {
        (
            NaiveDate::from_ymd_opt(year - 1, 10, 1).expect("valid date"),
            NaiveDate::from_ymd_opt(year, 4, 30).expect("valid date"),
        )
    }
}

/// Fraction of the season window actually observed, used as the data half of
/// the confidence figure.
pub fn coverage(metrics: &SeasonMetrics, start: NaiveDate, end: NaiveDate) -> f64 {
    let expected = (end - start).num_days().max(1) as f64 + 1.0;
    (metrics.observed_days as f64 / expected).clamp(0.0, 1.0)
}

/// Deterministic synthetic season for offline mode: a plausible temperate
/// year seeded by (region, year) so repeated calls agree.
pub fn synthetic_season(seed_key: &str, year: i32, latitude: f64) -> Vec<DailyWeather> {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(seed_key.as_bytes());
    hasher.update(year.to_le_bytes());
    let digest = hasher.finalize();
    let mut state = u64::from_le_bytes(digest[..8].try_into().expect("8 bytes"));
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((state >> 33) as f64 / (u32::MAX as f64)) - 0.5
    };

    let (start, end) = growing_season(year, latitude);
    let total_days = (end - start).num_days() + 1;
    let warmth_bias = next() * 4.0;
    let rain_bias = 1.0 + next() * 0.8;

    (0..total_days)
        .map(|offset| {
            let date = start + chrono::Duration::days(offset);
            // Seasonal arc peaking mid-window.
            let phase = offset as f64 / total_days as f64 * std::f64::consts::PI;
            let mean = 11.0 + warmth_bias + 9.0 * phase.sin() + next() * 3.0;
            let swing = 9.0 + next() * 4.0;
            let rain = if next() > -0.2 {
                0.0
            } else {
                (next().abs() * 14.0 * rain_bias).max(0.0)
            };
            DailyWeather {
                date,
                temp_max: mean + swing / 2.0,
                temp_min: mean - swing / 2.0,
                temp_mean: mean,
                precipitation: rain,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_season(mean: f64, swing: f64, rain_mm: f64, days: i64) -> Vec<DailyWeather> {
        let start = NaiveDate::from_ymd_opt(2019, 4, 1).unwrap();
        (0..days)
            .map(|offset| DailyWeather {
                date: start + chrono::Duration::days(offset),
                temp_max: mean + swing / 2.0,
                temp_min: mean - swing / 2.0,
                temp_mean: mean,
                precipitation: rain_mm,
            })
            .collect()
    }

    #[test]
    fn gdd_matches_hand_calculation() {
        // 20C mean over base 10 -> 10 GDD/day.
        let metrics = season_metrics(&flat_season(20.0, 8.0, 0.0, 30), 45.0);
        assert!((metrics.gdd - 300.0).abs() < 1e-9);
        assert!((metrics.diurnal_range - 8.0).abs() < 1e-9);
        assert_eq!(metrics.wet_days, 0);
    }

    #[test]
    fn extremes_counted() {
        let mut days = flat_season(20.0, 8.0, 0.0, 10);
        days[0].temp_max = 38.0;
        days[1].temp_min = -2.0;
        days[2].precipitation = 12.0;
        let metrics = season_metrics(&days, 45.0);
        assert_eq!(metrics.heatwave_days, 1);
        assert_eq!(metrics.frost_days, 1);
        assert_eq!(metrics.wet_days, 1);
    }

    #[test]
    fn warm_dry_season_beats_cold_wet() {
        let good = derive_scores(&season_metrics(&flat_season(18.0, 12.0, 0.6, 214), 45.0));
        let poor = derive_scores(&season_metrics(&flat_season(12.5, 6.0, 4.0, 214), 45.0));
        assert!(good.overall > poor.overall);
        assert!(good.ripeness > poor.ripeness);
        assert!((1.0..=5.0).contains(&good.acidity));
        assert!((0.0..=100.0).contains(&good.overall));
    }

    #[test]
    fn scorching_season_loses_acidity() {
        let hot = derive_scores(&season_metrics(&flat_season(26.0, 7.0, 0.2, 214), 38.0));
        let moderate = derive_scores(&season_metrics(&flat_season(17.5, 12.0, 0.6, 214), 45.0));
        assert!(hot.acidity < moderate.acidity);
    }

    #[test]
    fn hemisphere_windows() {
        let (north_start, north_end) = growing_season(2019, 44.8);
        assert_eq!(north_start.format("%Y-%m-%d").to_string(), "2019-04-01");
        assert_eq!(north_end.format("%Y-%m-%d").to_string(), "2019-10-31");

        let (south_start, south_end) = growing_season(2019, -34.5);
        assert_eq!(south_start.format("%Y-%m-%d").to_string(), "2018-10-01");
        assert_eq!(south_end.format("%Y-%m-%d").to_string(), "2019-04-30");
    }

    #[test]
    fn synthetic_season_is_deterministic() {
        let a = synthetic_season("bordeaux", 2015, 44.8);
        let b = synthetic_season("bordeaux", 2015, 44.8);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.temp_mean, y.temp_mean);
            assert_eq!(x.precipitation, y.precipitation);
        }

        let other_year = synthetic_season("bordeaux", 2016, 44.8);
        assert!(a
            .iter()
            .zip(&other_year)
            .any(|(x, y)| x.temp_mean != y.temp_mean));
    }

    #[test]
    fn coverage_fraction() {
        let days = flat_season(18.0, 10.0, 0.0, 107);
        let metrics = season_metrics(&days, 45.0);
        let (start, end) = growing_season(2019, 45.0);
        let c = coverage(&metrics, start, end);
        assert!(c > 0.49 && c < 0.51, "half the window observed, got {c}");
    }
}
