//! Simulation configuration
//!
//! Run-wide switches, loadable from JSON so experiments can be
//! described in files.

use serde::{Deserialize, Serialize};

fn default_node_name() -> String {
    "PARASOL Node".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Seed of the simulation random stream
    pub seed: u64,
    /// Report task state changes
    pub trace: bool,
    /// Log recoverable kernel call failures
    #[serde(default = "default_true")]
    pub warning: bool,
    /// Name of the node the kernel builds at startup
    #[serde(default = "default_node_name")]
    pub node0_name: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            trace: false,
            warning: true,
            node0_name: default_node_name(),
        }
    }
}

impl SimConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SimConfig::from_json(r#"{ "seed": 11 }"#).unwrap();
        assert_eq!(config.seed, 11);
        assert!(config.warning);
        assert!(!config.trace);
        assert_eq!(config.node0_name, "PARASOL Node");
    }

    #[test]
    fn test_json_roundtrip() {
        let config = SimConfig::default().with_seed(3).with_trace(true);
        let text = config.to_json().unwrap();
        assert_eq!(SimConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn test_unknown_field_rejected_type() {
        assert!(SimConfig::from_json(r#"{ "seed": "x" }"#).is_err());
    }
}
