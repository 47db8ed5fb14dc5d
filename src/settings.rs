//! Render settings persisted as JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::gpu::ColorMode;
use crate::video::DecodeOptions;

/// Every field has a default, so partial files load fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Bounded wait for a new decoded frame before the last one is reused.
    pub frame_wait_timeout_ms: u64,
    /// Decoder output poll timeout.
    pub dequeue_timeout_ms: u64,
    /// Empty polls tolerated before a decoder counts as stalled.
    pub max_stalled_polls: u32,
    /// Concurrently open decoders.
    pub max_decoders: usize,
    /// Decode pool size.
    pub worker_threads: usize,
    /// Extra `.glsl` effects.
    pub shader_dir: Option<PathBuf>,
    pub color_mode: ColorMode,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            frame_wait_timeout_ms: 500,
            dequeue_timeout_ms: 10,
            max_stalled_polls: 500,
            max_decoders: 4,
            worker_threads: (num_cpus::get() * 3 / 4).max(1),
            shader_dir: None,
            color_mode: ColorMode::Sdr,
        }
    }
}

impl RenderSettings {
    /// Load from `path`, falling back to defaults if missing or malformed.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(settings) => {
                    info!("Loaded settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    warn!("Malformed settings {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Cannot read settings {}: {}, using defaults", path.display(), e);
                }
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn frame_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_wait_timeout_ms)
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            dequeue_timeout: Duration::from_millis(self.dequeue_timeout_ms),
            max_stalled_polls: self.max_stalled_polls.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = RenderSettings::default();
        assert_eq!(s.frame_wait_timeout(), Duration::from_millis(500));
        assert_eq!(s.decode_options().max_stalled_polls, 500);
        assert_eq!(s.max_decoders, 4);
        assert!(s.worker_threads >= 1);
        assert_eq!(s.color_mode, ColorMode::Sdr);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let s: RenderSettings = serde_json::from_str(r#"{"max_decoders": 2, "color_mode": "hdr"}"#).unwrap();
        assert_eq!(s.max_decoders, 2);
        assert_eq!(s.color_mode, ColorMode::Hdr);
        assert_eq!(s.dequeue_timeout_ms, 10);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("framecraft.json");
        let mut s = RenderSettings::default();
        s.shader_dir = Some(PathBuf::from("/shaders"));
        s.save(&path).unwrap();
        assert_eq!(RenderSettings::load(&path), s);
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("framecraft.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(RenderSettings::load(&path).max_decoders, 4);
        assert_eq!(RenderSettings::load(&dir.path().join("missing.json")).max_decoders, 4);
    }
}
