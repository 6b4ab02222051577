//! Experiment allocation for pairing strategy variants.
//!
//! Assigns each request fingerprint to a heuristic weight profile and keeps
//! per-variant outcome statistics so a winning profile can graduate. The LCG
//! keeps assignment reproducible across restarts of the same seed.

use crate::pairing::heuristic::HeuristicWeights;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingVariant {
    /// Default weight profile.
    Control,
    /// Leans harder on regional tradition.
    RegionWeighted,
}

impl PairingVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairingVariant::Control => "control",
            PairingVariant::RegionWeighted => "region_weighted",
        }
    }

    pub fn weights(&self) -> HeuristicWeights {
        match self {
            PairingVariant::Control => HeuristicWeights::default(),
            PairingVariant::RegionWeighted => HeuristicWeights::region_weighted(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub enabled: bool,
    /// Probability a new fingerprint lands in the trial arm.
    pub trial_probability: f64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trial_probability: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VariantStats {
    pub requests: usize,
    pub feedback_count: usize,
    pub rating_sum: f64,
    pub avg_rating: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSummary {
    pub enabled: bool,
    pub assignments: usize,
    pub control: VariantStats,
    pub region_weighted: VariantStats,
}

#[derive(Debug)]
pub struct ExperimentAllocator {
    config: ExperimentConfig,
    assignments: HashMap<String, PairingVariant>,
    control: VariantStats,
    region_weighted: VariantStats,
    rng_state: u64,
}

impl Default for ExperimentAllocator {
    fn default() -> Self {
        Self::new(ExperimentConfig::default())
    }
}

impl ExperimentAllocator {
    pub fn new(config: ExperimentConfig) -> Self {
        Self {
            config,
            assignments: HashMap::new(),
            control: VariantStats::default(),
            region_weighted: VariantStats::default(),
            rng_state: 42,
        }
    }

    /// Simple LCG, reproducible across runs.
    fn next_random(&mut self) -> f64 {
        self.rng_state = self.rng_state.wrapping_mul(1103515245).wrapping_add(12345);
        ((self.rng_state >> 16) & 0x7FFF) as f64 / 32767.0
    }

    /// Get or assign the variant for a request fingerprint. Disabled
    /// experiments always run the control profile.
    pub fn get_variant(&mut self, fingerprint: &str) -> PairingVariant {
        if !self.config.enabled {
            return PairingVariant::Control;
        }
        if let Some(&variant) = self.assignments.get(fingerprint) {
            return variant;
        }
        let variant = if self.next_random() < self.config.trial_probability {
            PairingVariant::RegionWeighted
        } else {
            PairingVariant::Control
        };
        self.assignments.insert(fingerprint.to_string(), variant);
        variant
    }

    pub fn record_request(&mut self, variant: PairingVariant) {
        self.stats_mut(variant).requests += 1;
    }

    /// Fold a 1-5 overall rating into the variant's stats.
    pub fn record_outcome(&mut self, variant: PairingVariant, rating: f64) {
        let stats = self.stats_mut(variant);
        stats.feedback_count += 1;
        stats.rating_sum += rating;
        stats.avg_rating = stats.rating_sum / stats.feedback_count as f64;
    }

    pub fn variant_for(&self, fingerprint: &str) -> Option<PairingVariant> {
        self.assignments.get(fingerprint).copied()
    }

    fn stats_mut(&mut self, variant: PairingVariant) -> &mut VariantStats {
        match variant {
            PairingVariant::Control => &mut self.control,
            PairingVariant::RegionWeighted => &mut self.region_weighted,
        }
    }

    pub fn summary(&self) -> ExperimentSummary {
        ExperimentSummary {
            enabled: self.config.enabled,
            assignments: self.assignments.len(),
            control: self.control.clone(),
            region_weighted: self.region_weighted.clone(),
        }
    }
}
