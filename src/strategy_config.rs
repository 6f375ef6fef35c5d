// =============================================================================
// Strategy configuration document — persisted one-per-strategy under C2's
// `config/` namespace.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_true() -> bool {
    true
}

fn default_order_size() -> u32 {
    1
}

fn default_parameters() -> Map<String, Value> {
    Map::new()
}

/// {id, name, type, enabled, instrument_id, order_size, parameters map} per
/// §3. `parameters` is a free-form bag: every concrete strategy type defines
/// its own parameter schema and reads out of this map with its own defaults,
/// the same way the reference strategy config carries an `extra="allow"`
/// generic parameters container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub instrument_id: String,
    pub strategy_type: String,
    #[serde(default = "default_order_size")]
    pub order_size: u32,
    #[serde(default = "default_parameters")]
    pub parameters: Map<String, Value>,
}

impl StrategyConfig {
    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        self.parameters.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    pub fn param_u32(&self, key: &str, default: u32) -> u32 {
        self.parameters
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(default)
    }

    pub fn param_str(&self, key: &str, default: &str) -> String {
        self.parameters
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| default.to_string())
    }

    pub fn param_bool(&self, key: &str, default: bool) -> bool {
        self.parameters.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    /// Merge a partial-or-full update document into this config, the way
    /// the manager's `update_strategy_config` does: known top-level fields
    /// are replaced individually when present, everything else folds into
    /// `parameters`. The `id` field is never allowed to change via merge.
    pub fn merge(&mut self, patch: &Map<String, Value>) {
        let known = ["order_size", "instrument_id", "enabled", "name", "strategy_type", "id"];
        if let Some(name) = patch.get("name").and_then(Value::as_str) {
            self.name = name.to_string();
        }
        if let Some(enabled) = patch.get("enabled").and_then(Value::as_bool) {
            self.enabled = enabled;
        }
        if let Some(instrument_id) = patch.get("instrument_id").and_then(Value::as_str) {
            self.instrument_id = instrument_id.to_string();
        }
        if let Some(strategy_type) = patch.get("strategy_type").and_then(Value::as_str) {
            self.strategy_type = strategy_type.to_string();
        }
        if let Some(order_size) = patch.get("order_size").and_then(Value::as_u64) {
            self.order_size = order_size as u32;
        }
        if let Some(Value::Object(params)) = patch.get("parameters") {
            for (k, v) in params {
                self.parameters.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in patch {
            if !known.contains(&k.as_str()) && k != "parameters" {
                self.parameters.insert(k.clone(), v.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StrategyConfig {
        StrategyConfig {
            id: "orb-1".into(),
            name: "ORB Call".into(),
            enabled: true,
            instrument_id: "SPX.CBOE".into(),
            strategy_type: "OrbLongCall".into(),
            order_size: 1,
            parameters: Map::new(),
        }
    }

    #[test]
    fn merge_keeps_id_even_if_patch_includes_it() {
        let mut cfg = sample();
        let mut patch = Map::new();
        patch.insert("id".into(), Value::String("different".into()));
        patch.insert("enabled".into(), Value::Bool(false));
        cfg.merge(&patch);
        assert_eq!(cfg.id, "orb-1");
        assert!(!cfg.enabled);
    }

    #[test]
    fn merge_flat_legacy_params_fold_into_parameters() {
        let mut cfg = sample();
        let mut patch = Map::new();
        patch.insert("sl_atr_multiplier".into(), Value::from(1.8));
        cfg.merge(&patch);
        assert_eq!(cfg.param_f64("sl_atr_multiplier", 0.0), 1.8);
    }
}
