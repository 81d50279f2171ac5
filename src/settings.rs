//! Persisted renderer settings

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::Result;
use crate::render::RenderConfig;
use crate::streaming::StreamingConfig;

/// Everything a host persists between sessions
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub streaming: StreamingConfig,
    pub render: RenderConfig,
}

impl Settings {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let settings = serde_json::from_str(&json)?;
        log::info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        log::info!("Saved settings to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::config::MixMethod;
    use crate::streaming::MemSwap;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::default();
        settings.streaming.mem_swap = MemSwap::On;
        settings.streaming.up_time = 40;
        settings.render.mix_method = MixMethod::Multi;
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"render": {"peel_layers": 1}}"#).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.render.peel_layers, 1);
        assert_eq!(loaded.streaming, StreamingConfig::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Settings::load(&path).is_err());
        assert!(Settings::load(&dir.path().join("missing.json")).is_err());
    }
}
