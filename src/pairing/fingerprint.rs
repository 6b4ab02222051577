//! Deterministic cache keys for pairing requests.
//!
//! Identical (dish, context, preferences, visible inventory) must map to the
//! same fingerprint so concurrent identical requests share one provider call
//! and later ones hit the cache.

use crate::models::StockView;
use crate::pairing::{PairingContext, PairingOptions};
use sha2::{Digest, Sha256};

/// How many top-stocked vintages participate in the inventory signature.
const INVENTORY_SIGNATURE_TOP_N: usize = 10;

/// Lowercase, collapse whitespace runs, strip punctuation that carries no
/// culinary meaning.
pub fn normalize_dish(dish: &str) -> String {
    let mut out = String::with_capacity(dish.len());
    let mut last_space = true;
    for ch in dish.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_alphanumeric() {
            out.push(ch);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Stable text form of the request context. Field order is fixed; absent
/// fields serialize as empty so adding a field later shifts nothing.
fn canonical_context(context: &PairingContext) -> String {
    format!(
        "occasion={};guests={};season={};weather={};notes={}",
        context.occasion.as_deref().unwrap_or("").trim().to_ascii_lowercase(),
        context.guest_count.map(|g| g.to_string()).unwrap_or_default(),
        context.season.as_deref().unwrap_or("").trim().to_ascii_lowercase(),
        context.weather.as_deref().unwrap_or("").trim().to_ascii_lowercase(),
        context.notes.as_deref().unwrap_or("").trim().to_ascii_lowercase(),
    )
}

/// Signature over the top-N vintages by available bottle count. Sorted by
/// count descending then vintage id so ties are stable.
fn inventory_signature(inventory: &[StockView]) -> String {
    let mut top: Vec<(i64, i64)> = inventory
        .iter()
        .filter(|view| view.available > 0)
        .map(|view| (view.vintage_id, view.available))
        .collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    top.truncate(INVENTORY_SIGNATURE_TOP_N);
    top.iter()
        .map(|(id, available)| format!("{id}:{available}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn fingerprint(
    dish: &str,
    context: &PairingContext,
    preferences: &str,
    options: &PairingOptions,
    inventory: &[StockView],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_dish(dish).as_bytes());
    hasher.update(b"\x1f");
    hasher.update(canonical_context(context).as_bytes());
    hasher.update(b"\x1f");
    hasher.update(preferences.trim().to_ascii_lowercase().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(options.max_recommendations.to_string().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(inventory_signature(inventory).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WineType;

    fn view(vintage_id: i64, available: i64) -> StockView {
        StockView {
            vintage_id,
            wine_id: 1,
            wine_name: "x".into(),
            producer: "y".into(),
            region: "".into(),
            country: "".into(),
            wine_type: WineType::Red,
            year: 2020,
            location: "main-cellar".into(),
            quantity: available,
            reserved_quantity: 0,
            available,
            cost_per_bottle: None,
            quality_score: None,
            weather_score: None,
        }
    }

    #[test]
    fn dish_normalization() {
        assert_eq!(normalize_dish("  Grilled   Salmon! "), "grilled salmon");
        assert_eq!(normalize_dish("Côte de Bœuf"), normalize_dish("côte de bœuf"));
    }

    #[test]
    fn identical_inputs_identical_fingerprint() {
        let context = PairingContext {
            occasion: Some("casual-dining".into()),
            guest_count: Some(4),
            ..Default::default()
        };
        let options = PairingOptions::default();
        let inventory = vec![view(1, 5), view(2, 3)];

        let a = fingerprint("Grilled Salmon", &context, "", &options, &inventory);
        let b = fingerprint("grilled   salmon!", &context, "", &options, &inventory);
        assert_eq!(a, b);
    }

    #[test]
    fn inventory_changes_change_fingerprint() {
        let context = PairingContext::default();
        let options = PairingOptions::default();
        let a = fingerprint("salmon", &context, "", &options, &[view(1, 5)]);
        let b = fingerprint("salmon", &context, "", &options, &[view(1, 4)]);
        assert_ne!(a, b);
    }

    #[test]
    fn signature_ignores_below_top_n() {
        // Eleven vintages; the smallest one falls outside the signature.
        let mut inventory: Vec<StockView> = (1..=11).map(|i| view(i, 100 - i)).collect();
        let context = PairingContext::default();
        let options = PairingOptions::default();
        let a = fingerprint("salmon", &context, "", &options, &inventory);
        inventory[10].available -= 1; // vintage 11, the least stocked
        let b = fingerprint("salmon", &context, "", &options, &inventory);
        assert_eq!(a, b);
    }

    #[test]
    fn unavailable_stock_excluded() {
        let context = PairingContext::default();
        let options = PairingOptions::default();
        let mut zero = view(2, 0);
        zero.quantity = 3;
        zero.reserved_quantity = 3;
        zero.available = 0;
        let a = fingerprint("salmon", &context, "", &options, &[view(1, 5)]);
        let b = fingerprint("salmon", &context, "", &options, &[view(1, 5), zero]);
        assert_eq!(a, b);
    }
}
