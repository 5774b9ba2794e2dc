use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{BackoffPolicy, ChannelConfig};
use crate::coordinator::SessionOptions;
use crate::errors::PairchatError;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080/ws";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    #[serde(default = "default_true")]
    pub auto_start_call: bool,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub jitter: bool,
}

fn default_true() -> bool {
    true
}

fn default_relay_url() -> String {
    DEFAULT_RELAY_URL.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: None,
            relay_url: default_relay_url(),
            auto_start_call: true,
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 15_000,
            max_attempts: 8,
            jitter: true,
        }
    }
}

impl Settings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        let r = &self.reconnect;
        BackoffPolicy {
            initial_delay: Duration::from_millis(r.initial_delay_ms),
            max_delay: Duration::from_millis(r.max_delay_ms.max(r.initial_delay_ms)),
            max_attempts: r.max_attempts.max(1),
            jitter: r.jitter,
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            url: self.relay_url.clone(),
            display_name: self.display_name.clone(),
            backoff: self.backoff_policy(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            display_name: self.display_name.clone(),
            auto_start_call: self.auto_start_call,
        }
    }
}

pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        let name = name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        self.lock().display_name = name;
        self.save();
    }

    /// Rejects anything that is not a `ws://` or `wss://` URL.
    pub fn set_relay_url(&self, url: &str) -> Result<(), PairchatError> {
        let probe = ChannelConfig {
            url: url.to_string(),
            display_name: None,
            backoff: BackoffPolicy::default(),
            connect_timeout: CONNECT_TIMEOUT,
        };
        probe.connect_url()?;
        self.lock().relay_url = url.trim().to_string();
        self.save();
        Ok(())
    }

    pub fn set_auto_start_call(&self, enabled: bool) {
        self.lock().auto_start_call = enabled;
        self.save();
    }

    pub fn set_reconnect(&self, reconnect: ReconnectSettings) {
        self.lock().reconnect = reconnect;
        self.save();
    }

    fn lock(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self) {
        let settings = self.get();
        if let Err(e) = self.write(&settings) {
            tracing::warn!(path = %self.file_path.display(), "failed to save settings: {e}");
        }
    }

    fn write(&self, settings: &Settings) -> Result<(), PairchatError> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PairchatError::Settings(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(settings)
            .map_err(|e| PairchatError::Settings(e.to_string()))?;
        std::fs::write(&self.file_path, json).map_err(|e| PairchatError::Settings(e.to_string()))
    }

    fn load(path: &Path) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "ignoring unreadable settings: {e}");
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}
