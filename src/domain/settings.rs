use crate::infrastructure::bluetooth::codec::DEFAULT_MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// How to reach the BLE server process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Executable spawned with piped stdio
    #[serde(default = "default_server_path")]
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Connect to an already-running server over a local socket instead of spawning one
    #[serde(default)]
    pub local_socket: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            path: default_server_path(),
            args: Vec::new(),
            local_socket: None,
        }
    }
}

fn default_server_path() -> String {
    "BLEServer.exe".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Unset means requests wait until the link closes
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            request_timeout_ms: None,
        }
    }
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub bridge: BridgeSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load settings from an explicit file, using defaults if it can't be read
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleBridge");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "bridge": { "request_timeout_ms": 500 } }"#).unwrap();
        assert_eq!(settings.server.path, "BLEServer.exe");
        assert!(settings.server.local_socket.is_none());
        assert_eq!(settings.bridge.request_timeout_ms, Some(500));
        assert_eq!(settings.bridge.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!(
            "ble_bridge_settings_{}.json",
            std::process::id()
        ));
        let mut service = SettingsService::from_path(path.clone());
        service.settings.server.local_socket = Some("ble_server.sock".to_string());
        service.save().unwrap();

        let reloaded = SettingsService::from_path(path.clone());
        assert_eq!(
            reloaded.get().server.local_socket.as_deref(),
            Some("ble_server.sock")
        );
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_unreadable_file_falls_back_to_defaults() {
        let service = SettingsService::from_path(PathBuf::from("/nonexistent/ble_bridge.json"));
        assert_eq!(service.get().server.path, "BLEServer.exe");
        assert!(service.get().bridge.request_timeout_ms.is_none());
    }
}
