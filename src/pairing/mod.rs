//! AI-assisted food/wine pairing pipeline.

pub mod cache;
pub mod experiment;
pub mod fingerprint;
pub mod heuristic;
pub mod orchestrator;
pub mod providers;

use serde::{Deserialize, Serialize};

pub use cache::PairingCache;
pub use experiment::{ExperimentAllocator, ExperimentConfig, PairingVariant};
pub use heuristic::{HeuristicEngine, HeuristicWeights};
pub use orchestrator::PairingOrchestrator;
pub use providers::{ChatCompletionProvider, PairingProvider};

/// Which link of the provider chain produced a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    PrimaryAi,
    SecondaryAi,
    Heuristic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::PrimaryAi => "primary_ai",
            ProviderKind::SecondaryAi => "secondary_ai",
            ProviderKind::Heuristic => "heuristic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary_ai" => Some(Self::PrimaryAi),
            "secondary_ai" => Some(Self::SecondaryAi),
            "heuristic" => Some(Self::Heuristic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairingContext {
    #[serde(default)]
    pub occasion: Option<String>,
    #[serde(default)]
    pub guest_count: Option<u32>,
    #[serde(default)]
    pub season: Option<String>,
    #[serde(default)]
    pub weather: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PairingOptions {
    #[serde(default = "default_max_recommendations")]
    pub max_recommendations: usize,
    #[serde(default = "default_include_reasoning")]
    pub include_reasoning: bool,
}

fn default_max_recommendations() -> usize {
    5
}

fn default_include_reasoning() -> bool {
    true
}

impl Default for PairingOptions {
    fn default() -> Self {
        Self {
            max_recommendations: default_max_recommendations(),
            include_reasoning: default_include_reasoning(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRequest {
    pub dish: String,
    #[serde(default)]
    pub context: PairingContext,
    #[serde(default)]
    pub preferences: String,
    #[serde(default)]
    pub options: PairingOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WineSelection {
    pub vintage_id: i64,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairingResult {
    pub recommendation_id: String,
    pub fingerprint: String,
    pub provider: ProviderKind,
    pub selections: Vec<WineSelection>,
    pub from_cache: bool,
}

/// Guest feedback on a produced recommendation.
#[derive(Debug, Clone, Deserialize)]
pub struct PairingFeedback {
    pub recommendation_id: String,
    #[serde(default)]
    pub overall: Option<i64>,
    #[serde(default)]
    pub flavor_harmony: Option<i64>,
    #[serde(default)]
    pub texture_balance: Option<i64>,
    #[serde(default)]
    pub acidity_match: Option<i64>,
    #[serde(default)]
    pub tannin_balance: Option<i64>,
    #[serde(default)]
    pub body_match: Option<i64>,
    #[serde(default)]
    pub regional_tradition: Option<i64>,
    #[serde(default)]
    pub selected: Option<bool>,
    #[serde(default)]
    pub time_to_select_ms: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
}
