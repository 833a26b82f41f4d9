// SettingsManager Service
// Handles settings persistence and environment overrides

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_json::Value;

use crate::models::Settings;

pub const SETTINGS_FILE: &str = "settings.json";

/// Manages settings storage and retrieval.
/// The directory holding the settings file is the data directory: loaded
/// settings always carry it as `data_dir`.
pub struct SettingsManager {
    data_dir: PathBuf,
    settings_path: PathBuf,
    cache: RwLock<Option<Settings>>,
}

impl SettingsManager {
    /// Create a new SettingsManager with the given data directory
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            settings_path: data_dir.join(SETTINGS_FILE),
            cache: RwLock::new(None),
        }
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Load settings from disk, or return defaults if not found.
    /// Fields missing from the file are filled in from defaults and written back.
    pub fn load(&self) -> Result<Settings, String> {
        if let Ok(cache) = self.cache.read() {
            if let Some(ref settings) = *cache {
                return Ok(settings.clone());
            }
        }

        let settings = if self.settings_path.exists() {
            let content = std::fs::read_to_string(&self.settings_path)
                .map_err(|e| format!("Failed to read settings: {e}"))?;

            let mut user_value: Value = serde_json::from_str(&content)
                .map_err(|e| format!("Failed to parse settings: {e}"))?;

            let defaults_value = serde_json::to_value(self.defaults())
                .map_err(|e| format!("Failed to build default settings: {e}"))?;

            let changed = merge_missing_settings(&mut user_value, &defaults_value);

            let mut settings: Settings = serde_json::from_value(user_value)
                .map_err(|e| format!("Failed to parse settings: {e}"))?;
            self.pin_data_dir(&mut settings);

            if changed {
                log::info!("Added missing defaults to {}", self.settings_path.display());
                self.save_internal(&settings)?;
            }

            settings
        } else {
            log::info!("No settings at {}, writing defaults", self.settings_path.display());
            let defaults = self.defaults();
            self.save_internal(&defaults)?;
            defaults
        };

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(settings.clone());
        }

        Ok(settings)
    }

    fn data_dir_string(&self) -> String {
        self.data_dir.display().to_string()
    }

    fn defaults(&self) -> Settings {
        Settings {
            data_dir: self.data_dir_string(),
            ..Settings::default()
        }
    }

    fn pin_data_dir(&self, settings: &mut Settings) {
        let dir = self.data_dir_string();
        if settings.data_dir != dir {
            log::warn!(
                "dataDir '{}' in {} ignored, using {}",
                settings.data_dir,
                self.settings_path.display(),
                dir
            );
            settings.data_dir = dir;
        }
    }

    /// Save settings to disk
    pub fn save(&self, settings: &Settings) -> Result<(), String> {
        self.save_internal(settings)?;

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(settings.clone());
        }

        Ok(())
    }

    /// Internal save without cache update
    fn save_internal(&self, settings: &Settings) -> Result<(), String> {
        if let Some(parent) = self.settings_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings directory: {e}"))?;
        }

        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| format!("Failed to serialize settings: {e}"))?;

        std::fs::write(&self.settings_path, content)
            .map_err(|e| format!("Failed to write settings: {e}"))
    }
}

/// Apply `STREAMKEEPER_*` overrides on top of loaded settings.
/// `lookup` is `std::env::var` in production.
pub fn apply_env_overrides<F>(settings: &mut Settings, lookup: F) -> Result<(), String>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup("STREAMKEEPER_DATA_DIR") {
        settings.data_dir = dir;
    }
    if let Some(host) = lookup("STREAMKEEPER_HOST") {
        settings.host = host;
    }
    if let Some(port) = lookup("STREAMKEEPER_PORT") {
        settings.port = port
            .parse()
            .map_err(|e| format!("Invalid STREAMKEEPER_PORT '{port}': {e}"))?;
    }
    if let Some(max) = lookup("STREAMKEEPER_MAX_PARALLEL_STREAMS") {
        settings.max_parallel_streams = max
            .parse()
            .map_err(|e| format!("Invalid STREAMKEEPER_MAX_PARALLEL_STREAMS '{max}': {e}"))?;
    }
    Ok(())
}

fn merge_missing_settings(target: &mut Value, defaults: &Value) -> bool {
    match (target, defaults) {
        (Value::Object(target_map), Value::Object(defaults_map)) => {
            let mut changed = false;
            for (key, default_value) in defaults_map {
                match target_map.get_mut(key) {
                    Some(target_value) => {
                        if merge_missing_settings(target_value, default_value) {
                            changed = true;
                        }
                    }
                    None => {
                        target_map.insert(key.clone(), default_value.clone());
                        changed = true;
                    }
                }
            }
            changed
        }
        _ => false,
    }
}
