//! Config/data directory resolution.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "framecraft.json";
pub const LOG_FILE: &str = "framecraft.log";
const ENV_CONFIG_DIR: &str = "FRAMECRAFT_CONFIG_DIR";
const APP_DIR: &str = "framecraft";

/// Configuration for overriding default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var (FRAMECRAFT_CONFIG_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var(ENV_CONFIG_DIR).ok().map(PathBuf::from));
        Self { config_dir }
    }
}

/// Path of a configuration file.
///
/// Priority:
/// 1. CLI --config-dir argument
/// 2. FRAMECRAFT_CONFIG_DIR environment variable
/// 3. Current folder if it holds framecraft.json or framecraft.log
/// 4. Platform config directory from dirs-next (~/.config/framecraft on Linux)
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::config_dir).join(name)
}

/// Path of a data file (logs). Same priority as `config_file`, with the
/// platform data directory as the default (~/.local/share/framecraft on Linux).
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::data_dir).join(name)
}

/// Create the config and data directories if missing.
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    let config_dir = resolve_dir(config, dirs_next::config_dir);
    let data_dir = resolve_dir(config, dirs_next::data_dir);

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;
    }
    if data_dir != config_dir && !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    }
    Ok(())
}

fn has_local_config_files(dir: &Path) -> bool {
    [SETTINGS_FILE, LOG_FILE].iter().any(|f| dir.join(f).exists())
}

fn resolve_dir(config: &PathConfig, platform_dir: fn() -> Option<PathBuf>) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    if let Ok(current_dir) = std::env::current_dir()
        && has_local_config_files(&current_dir)
    {
        return current_dir;
    }
    if let Some(dir) = platform_dir() {
        return dir.join(APP_DIR);
    }
    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_with_custom_dir() {
        let config = PathConfig {
            config_dir: Some(PathBuf::from("/custom")),
        };
        assert_eq!(config_file("test.json", &config), PathBuf::from("/custom/test.json"));
        assert_eq!(data_file(LOG_FILE, &config), PathBuf::from("/custom/framecraft.log"));
    }

    #[test]
    fn test_cli_dir_wins_over_env() {
        let config = PathConfig::from_env_and_cli(Some(PathBuf::from("/from-cli")));
        assert_eq!(config.config_dir, Some(PathBuf::from("/from-cli")));
    }

    #[test]
    fn test_local_dir_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_local_config_files(dir.path()));
        std::fs::write(dir.path().join(SETTINGS_FILE), "{}").unwrap();
        assert!(has_local_config_files(dir.path()));
    }

    #[test]
    fn test_ensure_dirs_creates_custom_dir() {
        let root = tempfile::tempdir().unwrap();
        let config = PathConfig {
            config_dir: Some(root.path().join("nested").join("cfg")),
        };
        ensure_dirs(&config).unwrap();
        assert!(root.path().join("nested").join("cfg").is_dir());
    }
}
