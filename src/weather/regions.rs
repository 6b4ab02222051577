//! Built-in coordinates for the world's major wine regions.
//!
//! Resolution order: this table, then the geocoding API, then the country
//! centroid, then the reference region. Each step lowers the confidence the
//! enricher attaches to the derived scores.

#[derive(Debug, Clone, Copy)]
pub struct RegionInfo {
    pub name: &'static str,
    pub country: &'static str,
    pub latitude: f64,
    pub longitude: f64,
}

pub static WINE_REGIONS: &[RegionInfo] = &[
    RegionInfo { name: "bordeaux", country: "France", latitude: 44.84, longitude: -0.58 },
    RegionInfo { name: "burgundy", country: "France", latitude: 47.05, longitude: 4.86 },
    RegionInfo { name: "bourgogne", country: "France", latitude: 47.05, longitude: 4.86 },
    RegionInfo { name: "champagne", country: "France", latitude: 49.04, longitude: 4.03 },
    RegionInfo { name: "chablis", country: "France", latitude: 47.81, longitude: 3.80 },
    RegionInfo { name: "rhone", country: "France", latitude: 44.93, longitude: 4.89 },
    RegionInfo { name: "rhône", country: "France", latitude: 44.93, longitude: 4.89 },
    RegionInfo { name: "loire", country: "France", latitude: 47.25, longitude: 0.68 },
    RegionInfo { name: "alsace", country: "France", latitude: 48.16, longitude: 7.30 },
    RegionInfo { name: "provence", country: "France", latitude: 43.46, longitude: 5.98 },
    RegionInfo { name: "beaujolais", country: "France", latitude: 46.14, longitude: 4.66 },
    RegionInfo { name: "sauternes", country: "France", latitude: 44.53, longitude: -0.33 },
    RegionInfo { name: "languedoc", country: "France", latitude: 43.47, longitude: 3.35 },
    RegionInfo { name: "tuscany", country: "Italy", latitude: 43.46, longitude: 11.14 },
    RegionInfo { name: "toscana", country: "Italy", latitude: 43.46, longitude: 11.14 },
    RegionInfo { name: "piedmont", country: "Italy", latitude: 44.70, longitude: 8.04 },
    RegionInfo { name: "piemonte", country: "Italy", latitude: 44.70, longitude: 8.04 },
    RegionInfo { name: "barolo", country: "Italy", latitude: 44.61, longitude: 7.94 },
    RegionInfo { name: "veneto", country: "Italy", latitude: 45.44, longitude: 11.00 },
    RegionInfo { name: "sicily", country: "Italy", latitude: 37.60, longitude: 14.02 },
    RegionInfo { name: "rioja", country: "Spain", latitude: 42.29, longitude: -2.54 },
    RegionInfo { name: "ribera del duero", country: "Spain", latitude: 41.62, longitude: -3.69 },
    RegionInfo { name: "priorat", country: "Spain", latitude: 41.19, longitude: 0.75 },
    RegionInfo { name: "rias baixas", country: "Spain", latitude: 42.46, longitude: -8.72 },
    RegionInfo { name: "jerez", country: "Spain", latitude: 36.68, longitude: -6.14 },
    RegionInfo { name: "douro", country: "Portugal", latitude: 41.16, longitude: -7.79 },
    RegionInfo { name: "mosel", country: "Germany", latitude: 49.98, longitude: 7.12 },
    RegionInfo { name: "rheingau", country: "Germany", latitude: 50.01, longitude: 7.99 },
    RegionInfo { name: "pfalz", country: "Germany", latitude: 49.35, longitude: 8.14 },
    RegionInfo { name: "wachau", country: "Austria", latitude: 48.36, longitude: 15.43 },
    RegionInfo { name: "tokaj", country: "Hungary", latitude: 48.12, longitude: 21.41 },
    RegionInfo { name: "santorini", country: "Greece", latitude: 36.39, longitude: 25.46 },
    RegionInfo { name: "napa", country: "United States", latitude: 38.50, longitude: -122.27 },
    RegionInfo { name: "napa valley", country: "United States", latitude: 38.50, longitude: -122.27 },
    RegionInfo { name: "sonoma", country: "United States", latitude: 38.51, longitude: -122.85 },
    RegionInfo { name: "willamette", country: "United States", latitude: 45.22, longitude: -123.08 },
    RegionInfo { name: "finger lakes", country: "United States", latitude: 42.66, longitude: -76.93 },
    RegionInfo { name: "mendoza", country: "Argentina", latitude: -32.89, longitude: -68.84 },
    RegionInfo { name: "maipo", country: "Chile", latitude: -33.72, longitude: -70.73 },
    RegionInfo { name: "casablanca", country: "Chile", latitude: -33.32, longitude: -71.41 },
    RegionInfo { name: "barossa", country: "Australia", latitude: -34.53, longitude: 138.95 },
    RegionInfo { name: "margaret river", country: "Australia", latitude: -33.95, longitude: 115.07 },
    RegionInfo { name: "yarra valley", country: "Australia", latitude: -37.65, longitude: 145.45 },
    RegionInfo { name: "marlborough", country: "New Zealand", latitude: -41.51, longitude: 173.86 },
    RegionInfo { name: "central otago", country: "New Zealand", latitude: -45.03, longitude: 169.19 },
    RegionInfo { name: "stellenbosch", country: "South Africa", latitude: -33.93, longitude: 18.86 },
];

pub static COUNTRY_CENTERS: &[(&str, f64, f64)] = &[
    ("france", 46.60, 2.43),
    ("italy", 42.79, 12.67),
    ("spain", 40.24, -3.65),
    ("portugal", 39.68, -8.01),
    ("germany", 50.13, 10.22),
    ("austria", 47.59, 14.14),
    ("hungary", 47.16, 19.50),
    ("greece", 39.29, 22.61),
    ("united states", 39.78, -100.45),
    ("usa", 39.78, -100.45),
    ("argentina", -35.20, -65.17),
    ("chile", -35.68, -71.54),
    ("australia", -25.73, 134.49),
    ("new zealand", -41.81, 171.48),
    ("south africa", -30.56, 22.94),
];

/// Fallback when every other resolution step fails: temperate benchmark
/// climate that keeps the score pipeline defined.
pub static REFERENCE_REGION: RegionInfo = RegionInfo {
    name: "bordeaux",
    country: "France",
    latitude: 44.84,
    longitude: -0.58,
};

/// Lowercase, trim, collapse internal whitespace. The normalized form is the
/// weather_vintage cache key.
pub fn normalize_region(name: &str) -> String {
    name.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Table lookup with containment both ways so "Côtes du Rhône" finds "rhône"
/// and "napa" finds "napa valley".
pub fn lookup(name: &str) -> Option<&'static RegionInfo> {
    let normalized = normalize_region(name);
    if normalized.is_empty() {
        return None;
    }
    WINE_REGIONS
        .iter()
        .find(|region| region.name == normalized)
        .or_else(|| {
            WINE_REGIONS.iter().find(|region| {
                normalized.contains(region.name) || region.name.contains(normalized.as_str())
            })
        })
}

pub fn country_center(country: &str) -> Option<(f64, f64)> {
    let normalized = normalize_region(country);
    COUNTRY_CENTERS
        .iter()
        .find(|(name, _, _)| *name == normalized)
        .map(|(_, lat, lon)| (*lat, *lon))
}
