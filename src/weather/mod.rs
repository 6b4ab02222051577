//! Historical weather enrichment for vintages.

pub mod enricher;
pub mod open_meteo;
pub mod regions;
pub mod scores;

pub use enricher::{WeatherEnricher, WeatherVintage};
pub use open_meteo::OpenMeteoClient;
pub use scores::{DailyWeather, SeasonMetrics, WeatherScores};
