//! Per-model pricing (USD per 1K tokens) and cost computation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// USD per 1K prompt tokens.
    pub input: f64,
    /// USD per 1K completion tokens.
    pub output: f64,
}

impl ModelPricing {
    pub const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

const BUILTIN_PRICES: &[(&str, ModelPricing)] = &[
    ("claude-3-opus", ModelPricing::new(0.015, 0.075)),
    ("claude-3-sonnet", ModelPricing::new(0.003, 0.015)),
    ("claude-3-haiku", ModelPricing::new(0.00025, 0.00125)),
    ("claude-2.1", ModelPricing::new(0.008, 0.024)),
    ("claude-2.0", ModelPricing::new(0.008, 0.024)),
    ("claude-instant-1.2", ModelPricing::new(0.0008, 0.0024)),
    ("gpt-4", ModelPricing::new(0.03, 0.06)),
    ("gpt-3.5-turbo", ModelPricing::new(0.0015, 0.002)),
];

pub const DEFAULT_PRICING: ModelPricing = ModelPricing::new(0.01, 0.03);

/// Price table matched by lowercase model prefix, longest prefix first.
#[derive(Debug, Clone)]
pub struct PricingTable {
    entries: Vec<(String, ModelPricing)>,
    default: ModelPricing,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            entries: BUILTIN_PRICES
                .iter()
                .map(|(prefix, price)| (prefix.to_string(), *price))
                .collect(),
            default: DEFAULT_PRICING,
        }
    }
}

impl PricingTable {
    /// Built-in prices with `overrides` merged on top. A `default` key
    /// replaces the fallback price.
    pub fn with_overrides(overrides: &HashMap<String, ModelPricing>) -> Self {
        let mut table = Self::default();
        for (prefix, price) in overrides {
            let prefix = prefix.trim().to_ascii_lowercase();
            if prefix == "default" {
                table.default = *price;
                continue;
            }
            match table.entries.iter_mut().find(|(p, _)| *p == prefix) {
                Some(entry) => entry.1 = *price,
                None => table.entries.push((prefix, *price)),
            }
        }
        table
    }

    pub fn for_model(&self, model: Option<&str>) -> ModelPricing {
        let Some(model) = model.map(|m| m.to_ascii_lowercase()) else {
            return self.default;
        };
        self.entries
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, price)| *price)
            .unwrap_or(self.default)
    }

    pub fn cost(
        &self,
        model: Option<&str>,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> CostBreakdown {
        let price = self.for_model(model);
        let input_cost = prompt_tokens as f64 / 1000.0 * price.input;
        let output_cost = completion_tokens as f64 / 1000.0 * price.output;
        CostBreakdown {
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn prefix_match_and_default() {
        let table = PricingTable::default();
        assert_eq!(
            table.for_model(Some("claude-3-opus-20240229")),
            ModelPricing::new(0.015, 0.075)
        );
        assert_eq!(table.for_model(Some("GPT-4-0613")), ModelPricing::new(0.03, 0.06));
        assert_eq!(table.for_model(Some("unknown")), DEFAULT_PRICING);
        assert_eq!(table.for_model(None), DEFAULT_PRICING);
    }

    #[test]
    fn cost_is_per_thousand_tokens() {
        let table = PricingTable::default();
        let cost = table.cost(Some("claude-3-sonnet"), 2000, 1000);
        assert!(approx(cost.input_cost, 0.006));
        assert!(approx(cost.output_cost, 0.015));
        assert!(approx(cost.total_cost, 0.021));
    }

    #[test]
    fn overrides_replace_and_extend() {
        let mut overrides = HashMap::new();
        overrides.insert("gpt-4".to_string(), ModelPricing::new(1.0, 2.0));
        overrides.insert("gpt-4o".to_string(), ModelPricing::new(0.5, 0.5));
        overrides.insert("default".to_string(), ModelPricing::new(0.0, 0.0));
        let table = PricingTable::with_overrides(&overrides);

        assert_eq!(table.for_model(Some("gpt-4-turbo")), ModelPricing::new(1.0, 2.0));
        assert_eq!(table.for_model(Some("gpt-4o-mini")), ModelPricing::new(0.5, 0.5));
        assert!(approx(table.cost(Some("other"), 1000, 1000).total_cost, 0.0));
    }
}
