use dirs::config_dir;
use log::{info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::query_ast::errors::ConfigError;

/// Environment variable pointing at an explicit settings file
const CONFIG_PATH_VAR: &str = "OBJECTQUEL_CONFIG";
/// File name inside `<config dir>/objectquel/`
const CONFIG_FILE: &str = "optimizer.json";

/// Switches for the optimizer pipeline. Every pass is on unless disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub exists_extraction: bool,
    pub any_optimizer: bool,
    pub aggregate_optimizer: bool,
    pub self_join_optimizer: bool,
    pub join_optimizer: bool,
    pub dead_join_elimination: bool,
    /// Record explain output before/after every pass
    pub trace: bool,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            exists_extraction: true,
            any_optimizer: true,
            aggregate_optimizer: true,
            self_join_optimizer: true,
            join_optimizer: true,
            dead_join_elimination: true,
            trace: false,
        }
    }
}

impl OptimizerSettings {
    /// Process-wide settings, loaded on first use.
    pub fn global() -> &'static OptimizerSettings {
        static INSTANCE: Lazy<OptimizerSettings> = Lazy::new(OptimizerSettings::load);
        &INSTANCE
    }

    /// Defaults, then the settings file (if any), then environment overrides.
    /// A broken file is logged and ignored.
    pub fn load() -> Self {
        dotenv::dotenv().ok();
        let mut settings = match settings_path() {
            Some(path) if path.exists() => match Self::load_from_path(&path) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Ignoring optimizer settings at {}: {}", path.display(), e);
                    Self::default()
                }
            },
            _ => Self::default(),
        };
        settings.apply_env();
        settings
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let settings: OptimizerSettings = serde_json::from_str(&content)?;
        info!("Loaded optimizer settings from {}", path.display());
        Ok(settings)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// `OBJECTQUEL_TRACE=1` and `OBJECTQUEL_DISABLE_PASSES=any_optimizer,self_join_optimizer`
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("OBJECTQUEL_TRACE") {
            self.trace = matches!(v.trim(), "1" | "true" | "yes");
        }
        if let Ok(list) = std::env::var("OBJECTQUEL_DISABLE_PASSES") {
            for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                if !self.disable(name) {
                    warn!("OBJECTQUEL_DISABLE_PASSES names unknown pass: {}", name);
                }
            }
        }
    }

    /// Turn one pass off by name. Returns `false` for unknown names.
    pub fn disable(&mut self, pass: &str) -> bool {
        let flag = match pass {
            "exists_extraction" => &mut self.exists_extraction,
            "any_optimizer" => &mut self.any_optimizer,
            "aggregate_optimizer" => &mut self.aggregate_optimizer,
            "self_join_optimizer" => &mut self.self_join_optimizer,
            "join_optimizer" => &mut self.join_optimizer,
            "dead_join_elimination" => &mut self.dead_join_elimination,
            _ => return false,
        };
        *flag = false;
        true
    }

    pub fn is_enabled(&self, pass: &str) -> bool {
        match pass {
            "exists_extraction" => self.exists_extraction,
            "any_optimizer" => self.any_optimizer,
            "aggregate_optimizer" => self.aggregate_optimizer,
            "self_join_optimizer" => self.self_join_optimizer,
            "join_optimizer" => self.join_optimizer,
            "dead_join_elimination" => self.dead_join_elimination,
            _ => true,
        }
    }
}

/// `$OBJECTQUEL_CONFIG`, else `<config dir>/objectquel/optimizer.json`
pub fn settings_path() -> Option<PathBuf> {
    if let Ok(custom) = std::env::var(CONFIG_PATH_VAR) {
        let path = PathBuf::from(custom);
        if !path.as_os_str().is_empty() {
            return Some(path);
        }
    }
    config_dir().map(|mut dir| {
        dir.push("objectquel");
        dir.push(CONFIG_FILE);
        dir
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let settings: OptimizerSettings = serde_json::from_str(r#"{ "trace": true, "any_optimizer": false }"#).unwrap();
        assert!(settings.trace);
        assert!(!settings.any_optimizer);
        assert!(settings.self_join_optimizer);
    }

    #[test]
    fn disable_by_name() {
        let mut settings = OptimizerSettings::default();
        assert!(settings.disable("dead_join_elimination"));
        assert!(!settings.is_enabled("dead_join_elimination"));
        assert!(!settings.disable("no_such_pass"));
    }

    #[test]
    fn round_trips_through_file() {
        let dir = std::env::temp_dir().join(format!("objectquel-settings-{}", std::process::id()));
        let path = dir.join(CONFIG_FILE);
        let mut settings = OptimizerSettings::default();
        settings.trace = true;
        settings.save_to_path(&path).unwrap();
        let loaded = OptimizerSettings::load_from_path(&path).unwrap();
        assert_eq!(loaded, settings);
        let _ = fs::remove_dir_all(&dir);
    }
}
