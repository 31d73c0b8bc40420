use std::path::{Path, PathBuf};

use crate::config::AlignConfig;

pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("stackalign")
        .join("settings.json")
}

pub fn save_settings(config: &AlignConfig) -> anyhow::Result<()> {
    save_settings_to(config, &settings_path())
}

pub fn save_settings_to(config: &AlignConfig, settings_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = settings_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(settings_path, json)?;

    log::info!("Settings saved to: {}", settings_path.display());
    Ok(())
}

pub fn load_settings() -> AlignConfig {
    load_settings_from(&settings_path())
}

pub fn load_settings_from(settings_path: &Path) -> AlignConfig {
    if settings_path.exists() {
        match std::fs::read_to_string(settings_path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    log::info!("Settings loaded from: {}", settings_path.display());
                    config
                }
                Err(e) => {
                    log::warn!("Failed to parse settings file: {}. Using defaults.", e);
                    AlignConfig::default()
                }
            },
            Err(e) => {
                log::warn!("Failed to read settings file: {}. Using defaults.", e);
                AlignConfig::default()
            }
        }
    } else {
        log::info!("No settings file found. Using defaults.");
        AlignConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BorderPolicy, MaskConfig};

    #[test]
    fn test_settings_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("settings.json");

        let config = AlignConfig {
            ratio_threshold: 0.75,
            workers: Some(3),
            border: BorderPolicy::Replicate,
            mask: Some(MaskConfig::new("mask.png")),
            ..AlignConfig::default()
        };
        save_settings_to(&config, &path)?;

        let loaded = load_settings_from(&path);
        assert_eq!(loaded.ratio_threshold, 0.75);
        assert_eq!(loaded.workers, Some(3));
        assert_eq!(loaded.border, BorderPolicy::Replicate);
        assert_eq!(loaded.mask, Some(MaskConfig::new("mask.png")));
        Ok(())
    }

    #[test]
    fn test_unparsable_settings_fall_back_to_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json")?;

        let loaded = load_settings_from(&path);
        assert_eq!(loaded.ratio_threshold, AlignConfig::default().ratio_threshold);
        assert_eq!(loaded.aligned_prefix, "al_");
        Ok(())
    }
}
