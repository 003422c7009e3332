use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    /// Server URL passed to the most recent successful `init`.
    #[serde(default)]
    pub last_server_url: Option<String>,
    #[serde(default = "default_true")]
    pub auto_subscribe: bool,
    #[serde(default)]
    pub adaptive_stream: bool,
    #[serde(default)]
    pub dynacast: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            last_server_url: None,
            auto_subscribe: true,
            adaptive_stream: false,
            dynacast: false,
        }
    }
}

/// JSON-backed settings, persisted to `settings.json` on every change.
pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_last_server_url(&self, url: Option<String>) {
        self.update(|s| s.last_server_url = url);
    }

    pub fn set_auto_subscribe(&self, enabled: bool) {
        self.update(|s| s.auto_subscribe = enabled);
    }

    pub fn set_adaptive_stream(&self, enabled: bool) {
        self.update(|s| s.adaptive_stream = enabled);
    }

    pub fn set_dynacast(&self, enabled: bool) {
        self.update(|s| s.dynacast = enabled);
    }

    fn update(&self, apply: impl FnOnce(&mut Settings)) {
        let snapshot = {
            let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
            apply(&mut settings);
            settings.clone()
        };
        self.save(&snapshot);
    }

    fn save(&self, settings: &Settings) {
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let written = serde_json::to_string_pretty(settings)
            .map_err(|e| e.to_string())
            .and_then(|json| std::fs::write(&self.file_path, json).map_err(|e| e.to_string()));
        if let Err(e) = written {
            tracing::warn!("failed to save settings to {}: {e}", self.file_path.display());
        }
    }

    fn load(path: &Path) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring unreadable settings at {}: {e}", path.display());
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_default_settings() {
        let s = Settings::default();
        assert_eq!(s.last_server_url, None);
        assert!(s.auto_subscribe);
        assert!(!s.adaptive_stream);
        assert!(!s.dynacast);
    }

    #[test]
    fn test_new_creates_defaults_when_no_file() {
        let dir = temp_dir();
        let store = SettingsStore::new(dir.path().to_str().unwrap());
        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn test_last_server_url_persists() {
        let dir = temp_dir();
        let path = dir.path().to_str().unwrap();
        {
            let store = SettingsStore::new(path);
            store.set_last_server_url(Some("wss://rtc.example.com".to_string()));
        }
        let store = SettingsStore::new(path);
        assert_eq!(
            store.get().last_server_url.as_deref(),
            Some("wss://rtc.example.com")
        );
    }

    #[test]
    fn test_room_options_persist() {
        let dir = temp_dir();
        let path = dir.path().to_str().unwrap();
        {
            let store = SettingsStore::new(path);
            store.set_auto_subscribe(false);
            store.set_adaptive_stream(true);
            store.set_dynacast(true);
        }
        let s = SettingsStore::new(path).get();
        assert!(!s.auto_subscribe);
        assert!(s.adaptive_stream);
        assert!(s.dynacast);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = temp_dir();
        let path = dir.path().to_str().unwrap();
        fs::write(dir.path().join("settings.json"), "not json!!!").unwrap();
        let store = SettingsStore::new(path);
        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn test_partial_json_uses_serde_defaults() {
        let dir = temp_dir();
        let path = dir.path().to_str().unwrap();
        fs::write(
            dir.path().join("settings.json"),
            r#"{"last_server_url":"wss://a.example"}"#,
        )
        .unwrap();
        let s = SettingsStore::new(path).get();
        assert_eq!(s.last_server_url.as_deref(), Some("wss://a.example"));
        assert!(s.auto_subscribe);
        assert!(!s.dynacast);
    }
}
