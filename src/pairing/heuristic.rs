//! Rule-based pairing fallback.
//!
//! Always available, deterministic, and cheap: scores every available vintage
//! against the dish using type affinity, regional tradition, intensity match,
//! availability, and vintage quality. The weight profile is injectable so the
//! experiment allocator can trial variants.

use crate::error::{CoreError, CoreResult};
use crate::models::{StockView, WineType};
use crate::pairing::{PairingRequest, ProviderKind, WineSelection};
use async_trait::async_trait;

use super::providers::PairingProvider;

/// Broad dish families the keyword classifier can land on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DishCategory {
    Seafood,
    Shellfish,
    RedMeat,
    Poultry,
    Pork,
    Game,
    Spicy,
    Cheese,
    Dessert,
    Vegetable,
    Mushroom,
    Unknown,
}

const CATEGORY_KEYWORDS: &[(DishCategory, &[&str])] = &[
    (
        DishCategory::Shellfish,
        &["oyster", "lobster", "crab", "shrimp", "prawn", "scallop", "langoustine", "clam", "mussel"],
    ),
    (
        DishCategory::Seafood,
        &["salmon", "tuna", "fish", "halibut", "cod", "seabass", "sea bass", "sole", "trout", "turbot", "ceviche", "sashimi", "sushi"],
    ),
    (
        DishCategory::RedMeat,
        &["beef", "steak", "lamb", "ribeye", "filet", "wagyu", "short rib", "brisket", "veal", "côte de boeuf", "cote de boeuf"],
    ),
    (
        DishCategory::Poultry,
        &["chicken", "duck", "turkey", "quail", "poussin", "guinea fowl"],
    ),
    (DishCategory::Pork, &["pork", "ham", "prosciutto", "charcuterie", "sausage", "bacon"]),
    (DishCategory::Game, &["venison", "boar", "pheasant", "partridge", "hare", "pigeon"]),
    (
        DishCategory::Spicy,
        &["curry", "spicy", "chili", "szechuan", "thai", "harissa", "vindaloo", "kimchi"],
    ),
    (DishCategory::Cheese, &["cheese", "brie", "camembert", "roquefort", "stilton", "parmesan", "comté", "comte"]),
    (
        DishCategory::Dessert,
        &["dessert", "chocolate", "tart", "cake", "soufflé", "souffle", "crème brûlée", "creme brulee", "panna cotta", "sorbet"],
    ),
    (
        DishCategory::Mushroom,
        &["mushroom", "truffle", "porcini", "chanterelle", "morel"],
    ),
    (
        DishCategory::Vegetable,
        &["salad", "vegetable", "vegetarian", "vegan", "asparagus", "risotto", "pasta", "tomato"],
    ),
];

/// Cooking-method cues that raise or lower perceived dish intensity (1..=5).
const HEAVY_METHODS: &[&str] = &["grilled", "roasted", "braised", "smoked", "barbecue", "bbq", "seared", "confit"];
const LIGHT_METHODS: &[&str] = &["steamed", "poached", "raw", "ceviche", "tartare", "carpaccio"];

#[derive(Debug, Clone, Copy)]
pub struct DishProfile {
    pub category: DishCategory,
    pub intensity: f64,
}

pub fn classify_dish(dish: &str) -> DishProfile {
    let lower = dish.to_lowercase();

    let mut category = DishCategory::Unknown;
    'outer: for (candidate, keywords) in CATEGORY_KEYWORDS {
        for keyword in *keywords {
            if lower.contains(keyword) {
                category = *candidate;
                break 'outer;
            }
        }
    }

    let mut intensity: f64 = match category {
        DishCategory::RedMeat | DishCategory::Game => 4.0,
        DishCategory::Pork | DishCategory::Cheese | DishCategory::Spicy => 3.0,
        DishCategory::Poultry | DishCategory::Mushroom => 2.5,
        DishCategory::Seafood | DishCategory::Shellfish | DishCategory::Vegetable => 2.0,
        DishCategory::Dessert => 2.5,
        DishCategory::Unknown => 2.5,
    };
    if HEAVY_METHODS.iter().any(|m| lower.contains(m)) {
        intensity += 1.0;
    }
    if LIGHT_METHODS.iter().any(|m| lower.contains(m)) {
        intensity -= 0.5;
    }

    DishProfile {
        category,
        intensity: intensity.clamp(1.0, 5.0),
    }
}

/// Base affinity of a wine type for a dish family, 0..1.
fn type_affinity(wine_type: WineType, category: DishCategory) -> f64 {
    use DishCategory::*;
    use WineType::*;
    match (wine_type, category) {
        (White, Seafood) | (White, Shellfish) => 0.90,
        (Sparkling, Shellfish) => 0.85,
        (Sparkling, Seafood) => 0.70,
        (Red, RedMeat) | (Red, Game) => 0.92,
        (Red, Mushroom) => 0.80,
        (Red, Cheese) => 0.70,
        (Red, Pork) => 0.65,
        (Red, Poultry) => 0.60,
        (White, Poultry) => 0.72,
        (White, Vegetable) => 0.75,
        (White, Cheese) => 0.60,
        (Rose, Seafood) | (Rose, Vegetable) => 0.65,
        (Rose, Spicy) => 0.70,
        (White, Spicy) => 0.75,
        (Sparkling, Spicy) => 0.60,
        (WineType::Dessert, DishCategory::Dessert) => 0.95,
        (WineType::Dessert, Cheese) => 0.80,
        (Fortified, DishCategory::Dessert) => 0.85,
        (Fortified, Cheese) => 0.85,
        (Red, Seafood) | (Red, Shellfish) => 0.25,
        (WineType::Dessert, _) | (Fortified, _) => 0.20,
        (Red, DishCategory::Dessert) | (White, DishCategory::Dessert) => 0.20,
        (Red, Spicy) => 0.40,
        (_, Unknown) => 0.55,
        _ => 0.50,
    }
}

/// Classic region-tradition matches. Each hit adds a flat bonus.
const REGION_TRADITIONS: &[(DishCategory, &[&str])] = &[
    (DishCategory::Shellfish, &["chablis", "muscadet", "sancerre", "champagne"]),
    (DishCategory::Seafood, &["loire", "rias baixas", "rías baixas", "santorini", "mosel"]),
    (DishCategory::RedMeat, &["bordeaux", "napa", "rioja", "tuscany", "barossa", "mendoza"]),
    (DishCategory::Game, &["burgundy", "rhone", "rhône", "piedmont"]),
    (DishCategory::Poultry, &["burgundy", "beaujolais"]),
    (DishCategory::Mushroom, &["burgundy", "piedmont", "barolo"]),
    (DishCategory::Cheese, &["jura", "loire", "port", "douro"]),
    (DishCategory::Dessert, &["sauternes", "tokaj", "port", "douro", "banyuls"]),
    (DishCategory::Spicy, &["alsace", "mosel", "rheingau"]),
];

fn region_tradition(region: &str, category: DishCategory) -> bool {
    let lower = region.to_lowercase();
    REGION_TRADITIONS
        .iter()
        .filter(|(c, _)| *c == category)
        .any(|(_, regions)| regions.iter().any(|r| lower.contains(r)))
}

/// Rough body/intensity of a wine on the dish's 1..5 scale.
fn wine_intensity(view: &StockView) -> f64 {
    let base = match view.wine_type {
        WineType::Red => 3.8,
        WineType::Fortified => 4.2,
        WineType::Dessert => 3.0,
        WineType::White => 2.2,
        WineType::Rose => 2.0,
        WineType::Sparkling => 1.8,
    };
    // Older reds soften; very young reds sit heavier.
    let age = (chrono::Utc::now().format("%Y").to_string().parse::<i64>().unwrap_or(2025)
        - view.year as i64)
        .max(0) as f64;
    if view.wine_type == WineType::Red && age > 15.0 {
        base - 0.5
    } else {
        base
    }
}

/// Weight profile for the scoring terms. Variants come from the experiment
/// allocator; `default()` is the control arm.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicWeights {
    pub type_affinity: f64,
    pub region_tradition: f64,
    pub intensity_match: f64,
    pub availability: f64,
    pub vintage_quality: f64,
}

impl Default for HeuristicWeights {
    fn default() -> Self {
        Self {
            type_affinity: 0.45,
            region_tradition: 0.15,
            intensity_match: 0.20,
            availability: 0.10,
            vintage_quality: 0.10,
        }
    }
}

impl HeuristicWeights {
    /// Trial arm that leans harder on regional tradition.
    pub fn region_weighted() -> Self {
        Self {
            type_affinity: 0.35,
            region_tradition: 0.30,
            intensity_match: 0.15,
            availability: 0.10,
            vintage_quality: 0.10,
        }
    }
}

pub struct HeuristicEngine {
    weights: HeuristicWeights,
}

impl HeuristicEngine {
    pub fn new(weights: HeuristicWeights) -> Self {
        Self { weights }
    }

    pub fn score(&self, view: &StockView, profile: &DishProfile) -> (f64, Vec<&'static str>) {
        let w = &self.weights;
        let mut notes: Vec<&'static str> = Vec::new();

        let affinity = type_affinity(view.wine_type, profile.category);
        if affinity >= 0.8 {
            notes.push("classic style match for the dish");
        }

        let tradition = if region_tradition(&view.region, profile.category) {
            notes.push("regional tradition");
            1.0
        } else {
            0.0
        };

        let intensity_gap = (wine_intensity(view) - profile.intensity).abs();
        let intensity = (1.0 - intensity_gap / 4.0).clamp(0.0, 1.0);
        if intensity >= 0.85 {
            notes.push("weight of the wine matches the dish");
        }

        let availability = ((view.available as f64).ln_1p() / 3.0_f64.ln_1p()).min(1.0);

        let quality = view
            .quality_score
            .or(view.weather_score)
            .map(|s| (s / 100.0).clamp(0.0, 1.0))
            .unwrap_or(0.5);
        if quality >= 0.85 {
            notes.push("standout vintage");
        }

        let score = w.type_affinity * affinity
            + w.region_tradition * tradition
            + w.intensity_match * intensity
            + w.availability * availability
            + w.vintage_quality * quality;

        (score.clamp(0.02, 0.98), notes)
    }

    fn reasoning(view: &StockView, notes: &[&'static str]) -> String {
        if notes.is_empty() {
            format!(
                "{} {} ({}) is a sound, available choice",
                view.producer, view.wine_name, view.year
            )
        } else {
            format!(
                "{} {} ({}): {}",
                view.producer,
                view.wine_name,
                view.year,
                notes.join("; ")
            )
        }
    }
}

#[async_trait]
impl PairingProvider for HeuristicEngine {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Heuristic
    }

    async fn recommend(
        &self,
        request: &PairingRequest,
        inventory: &[StockView],
    ) -> CoreResult<Vec<WineSelection>> {
        if inventory.is_empty() {
            return Err(CoreError::ProviderError(
                "no available inventory to pair against".to_string(),
            ));
        }
        let profile = classify_dish(&request.dish);

        let mut scored: Vec<(f64, &StockView, Vec<&'static str>)> = inventory
            .iter()
            .filter(|view| view.available > 0)
            .map(|view| {
                let (score, notes) = self.score(view, &profile);
                (score, view, notes)
            })
            .collect();
        // Ties resolve by vintage id so the output is fully deterministic.
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.vintage_id.cmp(&b.1.vintage_id))
        });
        scored.truncate(request.options.max_recommendations);

        Ok(scored
            .into_iter()
            .map(|(score, view, notes)| WineSelection {
                vintage_id: view.vintage_id,
                confidence: score,
                reasoning: request
                    .options
                    .include_reasoning
                    .then(|| Self::reasoning(view, &notes)),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::{PairingContext, PairingOptions};

    fn view(vintage_id: i64, wine_type: WineType, region: &str, available: i64) -> StockView {
        StockView {
            vintage_id,
            wine_id: vintage_id,
            wine_name: format!("Wine {vintage_id}"),
            producer: "Producer".into(),
            region: region.to_string(),
            country: "France".into(),
            wine_type,
            year: 2018,
            location: "main-cellar".into(),
            quantity: available,
            reserved_quantity: 0,
            available,
            cost_per_bottle: None,
            quality_score: Some(88.0),
            weather_score: None,
        }
    }

    fn request(dish: &str) -> PairingRequest {
        PairingRequest {
            dish: dish.to_string(),
            context: PairingContext::default(),
            preferences: String::new(),
            options: PairingOptions {
                max_recommendations: 3,
                include_reasoning: true,
            },
        }
    }

    #[test]
    fn classifier_finds_categories() {
        assert_eq!(classify_dish("Grilled salmon fillet").category, DishCategory::Seafood);
        assert_eq!(classify_dish("Côte de boeuf").category, DishCategory::RedMeat);
        assert_eq!(classify_dish("Oysters on ice").category, DishCategory::Shellfish);
        assert_eq!(classify_dish("Mystery plate").category, DishCategory::Unknown);
    }

    #[test]
    fn grilling_raises_intensity() {
        let poached = classify_dish("poached salmon");
        let grilled = classify_dish("grilled salmon");
        assert!(grilled.intensity > poached.intensity);
    }

    #[tokio::test]
    async fn white_beats_red_for_fish() {
        let engine = HeuristicEngine::new(HeuristicWeights::default());
        let inventory = vec![
            view(1, WineType::Red, "Bordeaux", 6),
            view(2, WineType::White, "Chablis", 6),
        ];
        let selections = engine
            .recommend(&request("grilled salmon"), &inventory)
            .await
            .unwrap();
        assert_eq!(selections[0].vintage_id, 2);
        assert!(selections[0].confidence > selections[1].confidence);
    }

    #[tokio::test]
    async fn red_beats_white_for_steak() {
        let engine = HeuristicEngine::new(HeuristicWeights::default());
        let inventory = vec![
            view(1, WineType::Red, "Napa", 6),
            view(2, WineType::White, "Loire", 6),
        ];
        let selections = engine
            .recommend(&request("ribeye steak"), &inventory)
            .await
            .unwrap();
        assert_eq!(selections[0].vintage_id, 1);
    }

    #[tokio::test]
    async fn deterministic_output() {
        let engine = HeuristicEngine::new(HeuristicWeights::default());
        let inventory: Vec<StockView> = (1..=8)
            .map(|i| {
                view(
                    i,
                    if i % 2 == 0 { WineType::White } else { WineType::Red },
                    "Burgundy",
                    i,
                )
            })
            .collect();
        let first = engine
            .recommend(&request("roast duck"), &inventory)
            .await
            .unwrap();
        let second = engine
            .recommend(&request("roast duck"), &inventory)
            .await
            .unwrap();
        let ids: Vec<i64> = first.iter().map(|s| s.vintage_id).collect();
        let ids2: Vec<i64> = second.iter().map(|s| s.vintage_id).collect();
        assert_eq!(ids, ids2);
    }

    #[tokio::test]
    async fn respects_max_and_sorted_desc() {
        let engine = HeuristicEngine::new(HeuristicWeights::default());
        let inventory: Vec<StockView> =
            (1..=10).map(|i| view(i, WineType::Red, "Rioja", 4)).collect();
        let selections = engine
            .recommend(&request("lamb shoulder"), &inventory)
            .await
            .unwrap();
        assert!(selections.len() <= 3);
        for pair in selections.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
        for s in &selections {
            assert!((0.0..=1.0).contains(&s.confidence));
        }
    }

    #[tokio::test]
    async fn empty_inventory_is_provider_error() {
        let engine = HeuristicEngine::new(HeuristicWeights::default());
        let result = engine.recommend(&request("anything"), &[]).await;
        assert!(matches!(result, Err(CoreError::ProviderError(_))));
    }
}
