//! Electricity tariff tiers and their prices.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Discrete electricity-price category active at a given time.
///
/// Accepts the Tempo colour names as aliases when deserialized
/// (`blue` = low, `white` = medium, `red` = high).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TariffTier {
    /// Cheapest tier.
    #[serde(alias = "blue")]
    Low,
    /// Intermediate tier.
    #[serde(alias = "white")]
    Medium,
    /// Peak-price tier.
    #[serde(alias = "red")]
    High,
}

impl fmt::Display for TariffTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TariffTier::Low => "low",
            TariffTier::Medium => "medium",
            TariffTier::High => "high",
        };
        f.write_str(name)
    }
}

/// Price per kWh for each tariff tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TariffTable {
    /// Price of the low tier (per kWh).
    pub low: f64,
    /// Price of the medium tier (per kWh).
    pub medium: f64,
    /// Price of the high tier (per kWh).
    pub high: f64,
}

impl Default for TariffTable {
    fn default() -> Self {
        Self {
            low: 0.13,
            medium: 0.16,
            high: 0.65,
        }
    }
}

impl TariffTable {
    /// Returns the price per kWh for `tier`.
    pub fn price_per_kwh(&self, tier: TariffTier) -> f64 {
        match tier {
            TariffTier::Low => self.low,
            TariffTier::Medium => self.medium,
            TariffTier::High => self.high,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Row {
        tier: TariffTier,
    }

    #[test]
    fn tempo_colours_are_aliases() {
        let row: Row = toml::from_str("tier = \"red\"").expect("alias should parse");
        assert_eq!(row.tier, TariffTier::High);
        let row: Row = toml::from_str("tier = \"blue\"").expect("alias should parse");
        assert_eq!(row.tier, TariffTier::Low);
        let row: Row = toml::from_str("tier = \"medium\"").expect("name should parse");
        assert_eq!(row.tier, TariffTier::Medium);
    }

    #[test]
    fn price_lookup_follows_tier() {
        let table = TariffTable::default();
        assert!(table.price_per_kwh(TariffTier::High) > table.price_per_kwh(TariffTier::Medium));
        assert!(table.price_per_kwh(TariffTier::Medium) > table.price_per_kwh(TariffTier::Low));
    }
}
