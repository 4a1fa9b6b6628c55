use std::{
    fs::{self, File},
    io::{self, BufReader},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    auto_controller::ControllerSettings,
    fan_curve::{Curve, presets},
};

const APP_DIR: &str = "moss-fan";
const CONFIG_FILE: &str = "config.json";
const PRESETS_DIR: &str = "presets";
const PRESET_EXTENSION: &str = "json";

// Characters that are not allowed in a preset file name
const UNSAFE_CHARS: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{reason}: {}", .path.display())]
    Io {
        reason: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid preset name \"{0}\"")]
    InvalidName(String),
    #[error("No configuration directory available on this system")]
    NoConfigDir,
}

// User preferences persisted between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub last_selected_unit: usize,
    pub start_minimized: bool,
    pub start_with_os: bool,
    pub auto_start_last_profile: bool,
    pub last_profile: String,
    pub last_auto_mode_enabled: bool,

    pub controller: ControllerSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            last_selected_unit: 0,
            start_minimized: false,
            start_with_os: false,
            auto_start_last_profile: false,
            last_profile: presets::BALANCED.to_string(),
            last_auto_mode_enabled: false,
            controller: ControllerSettings::default(),
        }
    }
}

impl AppConfig {
    // Profile to restore at startup, if the user asked for it
    pub fn profile_to_restore(&self) -> Option<&str> {
        (self.auto_start_last_profile && self.last_auto_mode_enabled)
            .then_some(self.last_profile.as_str())
    }
}

// Replace every character that can't appear in a file name with '_'
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if UNSAFE_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

// One `<sanitized name>.json` file per preset
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
    presets_dir: PathBuf,
}

impl ConfigManager {
    pub fn new(config_path: &Path, presets_dir: &Path) -> Self {
        Self {
            config_path: config_path.to_path_buf(),
            presets_dir: presets_dir.to_path_buf(),
        }
    }

    // Base directory of the default store
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::default_dir()?.join(CONFIG_FILE))
    }

    pub fn default_presets_dir() -> Result<PathBuf, ConfigError> {
        Ok(Self::default_dir()?.join(PRESETS_DIR))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn presets_dir(&self) -> &Path {
        &self.presets_dir
    }

    // Load the configuration file, a missing or broken file
    // yields the default configuration
    pub fn load_config(&self) -> AppConfig {
        if !self.config_path.exists() {
            debug!(
                "No configuration file at {:?}, using defaults",
                self.config_path
            );

            return AppConfig::default();
        }

        match read_json(&self.config_path) {
            Ok(config) => config,
            Err(err) => {
                warn!("{err}, using the default configuration");

                AppConfig::default()
            }
        }
    }

    pub fn save_config(&self, config: &AppConfig) -> Result<(), ConfigError> {
        write_json(&self.config_path, config)?;

        debug!("Configuration saved to {:?}", self.config_path);

        Ok(())
    }

    // Remember the unit and curve of the last control change
    pub fn record_selection(
        &self,
        unit: usize,
        profile: Option<&str>,
    ) -> Result<(), ConfigError> {
        let mut config = self.load_config();

        config.last_selected_unit = unit;
        config.last_auto_mode_enabled = profile.is_some();
        if let Some(profile) = profile {
            config.last_profile = profile.to_string();
        }

        self.save_config(&config)
    }

    fn preset_path(&self, name: &str) -> Result<PathBuf, ConfigError> {
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidName(name.to_string()));
        }

        let file_name = format!("{}.{}", sanitize_file_name(name), PRESET_EXTENSION);

        Ok(self.presets_dir.join(file_name))
    }

    // Save a curve as a preset, overwriting any preset with the same name
    pub fn save_preset(&self, curve: &Curve) -> Result<PathBuf, ConfigError> {
        let path = self.preset_path(curve.name())?;

        write_json(&path, curve)?;

        info!("Preset \"{}\" saved to {:?}", curve.name(), path);

        Ok(path)
    }

    // Return None if no preset with this name was saved
    pub fn load_preset(&self, name: &str) -> Result<Option<Curve>, ConfigError> {
        let path = self.preset_path(name)?;

        if !path.exists() {
            return Ok(None);
        }

        read_json(&path).map(Some)
    }

    // Names of the stored presets, sorted.
    // Files that can't be parsed are skipped
    pub fn list_presets(&self) -> Result<Vec<String>, ConfigError> {
        let entries = match fs::read_dir(&self.presets_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ConfigError::Io {
                    reason: "Failed to read the presets directory",
                    path: self.presets_dir.clone(),
                    source,
                });
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension().is_some_and(|ext| ext == PRESET_EXTENSION)
            })
            .filter_map(|path| match read_json::<Curve>(&path) {
                Ok(curve) => Some(curve.name().to_string()),
                Err(err) => {
                    warn!("Skipping preset file: {err}");
                    None
                }
            })
            .collect();

        names.sort();

        Ok(names)
    }

    // Return false if there was nothing to delete
    pub fn delete_preset(&self, name: &str) -> Result<bool, ConfigError> {
        let path = self.preset_path(name)?;

        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Preset \"{}\" deleted", name);
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ConfigError::Io {
                reason: "Failed to delete preset file",
                path,
                source,
            }),
        }
    }

    // Find a curve by name, built-in presets shadow the stored ones
    pub fn resolve_curve(&self, name: &str) -> Result<Option<Curve>, ConfigError> {
        if let Some(curve) = presets::by_name(name) {
            return Ok(Some(curve));
        }

        self.load_preset(name)
    }

    // Write the built-in presets to the presets directory
    pub fn export_builtin_presets(&self) -> Result<Vec<PathBuf>, ConfigError> {
        presets::all()
            .iter()
            .map(|curve| self.save_preset(curve))
            .collect()
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::Io {
        reason: "Failed to open Json file",
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_reader(BufReader::new(file)).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            reason: "Failed to create directory",
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let file = File::create(path).map_err(|source| ConfigError::Io {
        reason: "Failed to open file for writing",
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::to_writer_pretty(file, value).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::fan_curve::CurvePoint;

    fn store() -> (TempDir, ConfigManager) {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(
            &dir.path().join(CONFIG_FILE),
            &dir.path().join(PRESETS_DIR),
        );

        (dir, manager)
    }

    #[test]
    fn missing_config_gives_defaults() {
        let (_dir, store) = store();

        let config = store.load_config();

        assert_eq!(config, AppConfig::default());
        assert_eq!(config.last_profile, "Balanced");
        assert_eq!(config.controller.tick_interval_ms, 2000);
        assert_eq!(config.controller.duty_threshold, 5);
        assert_eq!(config.controller.temperature_threshold, 2.);
    }

    #[test]
    fn corrupt_config_gives_defaults() {
        let (_dir, store) = store();
        fs::write(store.config_path(), "{ not json").unwrap();

        assert_eq!(store.load_config(), AppConfig::default());
    }

    #[test]
    fn partial_config_keeps_missing_defaults() {
        let (_dir, store) = store();
        fs::write(
            store.config_path(),
            r#"{ "last_selected_unit": 2, "controller": { "duty_threshold": 8 } }"#,
        )
        .unwrap();

        let config = store.load_config();

        assert_eq!(config.last_selected_unit, 2);
        assert_eq!(config.last_profile, "Balanced");
        assert_eq!(config.controller.duty_threshold, 8);
        assert_eq!(config.controller.tick_interval_ms, 2000);
    }

    #[test]
    fn config_round_trip() {
        let (_dir, store) = store();
        let config = AppConfig {
            last_selected_unit: 1,
            start_minimized: true,
            auto_start_last_profile: true,
            last_profile: "Night".to_string(),
            last_auto_mode_enabled: true,
            ..Default::default()
        };

        store.save_config(&config).unwrap();

        assert_eq!(store.load_config(), config);
        assert_eq!(config.profile_to_restore(), Some("Night"));
        assert_eq!(AppConfig::default().profile_to_restore(), None);
    }

    #[test]
    fn selection_is_recorded() {
        let (_dir, store) = store();

        store.record_selection(1, Some("Performance")).unwrap();
        let config = store.load_config();
        assert_eq!(config.last_selected_unit, 1);
        assert_eq!(config.last_profile, "Performance");
        assert!(config.last_auto_mode_enabled);

        // Manual control keeps the last profile around
        store.record_selection(0, None).unwrap();
        let config = store.load_config();
        assert_eq!(config.last_selected_unit, 0);
        assert_eq!(config.last_profile, "Performance");
        assert!(!config.last_auto_mode_enabled);
    }

    #[test]
    fn preset_round_trip() {
        let (_dir, store) = store();
        let curve = Curve::from_pairs("Night", &[(30., 20), (60., 45), (85., 100)]);

        store.save_preset(&curve).unwrap();

        assert_eq!(store.load_preset("Night").unwrap(), Some(curve));
        assert_eq!(store.load_preset("Day").unwrap(), None);
    }

    #[test]
    fn preset_file_name_is_sanitized() {
        let (_dir, store) = store();
        let curve = Curve::from_pairs("a/b:c*?", &[(50., 50)]);

        let path = store.save_preset(&curve).unwrap();

        assert_eq!(path.file_name().unwrap(), "a_b_c__.json");
        assert_eq!(store.load_preset("a/b:c*?").unwrap().unwrap().name(), "a/b:c*?");
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_file_name("Silent"), "Silent");
        assert_eq!(sanitize_file_name(r#"\"<>|"#), "_____");
        assert_eq!(sanitize_file_name("tab\there"), "tab_here");
    }

    #[test]
    fn blank_preset_name_is_rejected() {
        let (_dir, store) = store();

        assert!(matches!(
            store.save_preset(&Curve::new("  ", [])),
            Err(ConfigError::InvalidName(_))
        ));
    }

    #[test]
    fn stored_points_are_not_trusted() {
        let (_dir, store) = store();
        fs::create_dir_all(store.presets_dir()).unwrap();
        fs::write(
            store.presets_dir().join("Odd.json"),
            r#"{ "name": "Odd", "points": [
                { "temperature": 80, "duty": 250 },
                { "temperature": 40, "duty": -3 }
            ] }"#,
        )
        .unwrap();

        let curve = store.load_preset("Odd").unwrap().unwrap();

        assert_eq!(
            curve.points(),
            &[CurvePoint::new(40., 0), CurvePoint::new(80., 100)]
        );
    }

    #[test]
    fn list_and_delete_presets() {
        let (_dir, store) = store();
        assert!(store.list_presets().unwrap().is_empty());

        store.save_preset(&Curve::from_pairs("Zeta", &[(50., 50)])).unwrap();
        store.save_preset(&Curve::from_pairs("Alpha", &[(50., 50)])).unwrap();
        fs::write(store.presets_dir().join("broken.json"), "[").unwrap();
        fs::write(store.presets_dir().join("notes.txt"), "hello").unwrap();

        assert_eq!(store.list_presets().unwrap(), vec!["Alpha", "Zeta"]);

        assert!(store.delete_preset("Zeta").unwrap());
        assert!(!store.delete_preset("Zeta").unwrap());
        assert_eq!(store.list_presets().unwrap(), vec!["Alpha"]);
    }

    #[test]
    fn builtin_presets_shadow_stored_ones() {
        let (_dir, store) = store();
        store
            .save_preset(&Curve::from_pairs("Silent", &[(50., 100)]))
            .unwrap();
        store
            .save_preset(&Curve::from_pairs("Mine", &[(50., 70)]))
            .unwrap();

        assert_eq!(store.resolve_curve("silent").unwrap(), Some(presets::silent()));
        assert_eq!(store.resolve_curve("Mine").unwrap().unwrap().evaluate(50.), 70);
        assert_eq!(store.resolve_curve("Nothing").unwrap(), None);
    }

    #[test]
    fn export_writes_every_builtin() {
        let (_dir, store) = store();

        let paths = store.export_builtin_presets().unwrap();

        assert_eq!(paths.len(), 4);
        assert_eq!(
            store.list_presets().unwrap(),
            vec!["Aggressive", "Balanced", "Performance", "Silent"]
        );
        assert_eq!(store.load_preset("Performance").unwrap(), Some(presets::performance()));
    }
}
