//! Initialize the configuration directory: create ~/.subecho and a default config.json.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Create the config directory and write `config.json` with every default spelled out,
/// unless the file already exists. Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if config_path.exists() {
        log::debug!("config already exists at {}, leaving it alone", config_path.display());
    } else {
        let body = serde_json::to_string_pretty(&Config::default())
            .context("serializing default config")?;
        std::fs::write(config_path, body)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_defaults_once() {
        let dir = std::env::temp_dir().join(format!("subecho-init-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("config.json");

        let created = init_config_dir(&path).unwrap();
        assert_eq!(created, dir.join("nested"));
        let written: Config =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.gateway.port, Config::default().gateway.port);
        assert_eq!(written.harness.scenarios.len(), 7);

        std::fs::write(&path, "{\"gateway\":{\"port\":1}}").unwrap();
        init_config_dir(&path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("\"port\":1"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
