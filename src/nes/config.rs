use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

pub const DEFAULT_NMI_DELAY: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PpuConfig {
    // PPU cycles from the NMI edge to the interrupt; zero raises on the edge.
    pub nmi_delay: u8,
}

impl Default for PpuConfig {
    fn default() -> Self {
        Self {
            nmi_delay: DEFAULT_NMI_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NesConfig {
    pub ppu: PpuConfig,
    pub debug_event_capacity: usize,
    pub trace_capacity: usize,
}

impl Default for NesConfig {
    fn default() -> Self {
        Self {
            ppu: PpuConfig::default(),
            debug_event_capacity: 512,
            trace_capacity: 4096,
        }
    }
}

impl NesConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid console configuration")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to encode console configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = NesConfig::from_json(r#"{ "trace_capacity": 16 }"#).unwrap();
        assert_eq!(config.trace_capacity, 16);
        assert_eq!(config.debug_event_capacity, 512);
        assert_eq!(config.ppu.nmi_delay, DEFAULT_NMI_DELAY);

        let config = NesConfig::from_json(r#"{ "ppu": {} }"#).unwrap();
        assert_eq!(config, NesConfig::default());
    }

    #[test]
    fn round_trips_through_json() {
        let config = NesConfig {
            ppu: PpuConfig { nmi_delay: 0 },
            debug_event_capacity: 8,
            trace_capacity: 32,
        };
        let text = config.to_json().unwrap();
        assert_eq!(NesConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(NesConfig::from_json("{ \"ppu\": { \"nmi_delay\": 300 } }").is_err());
        assert!(NesConfig::from_json("not json").is_err());
    }
}
