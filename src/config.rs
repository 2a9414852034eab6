use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::bus::BusOptions;
use crate::capture::CaptureSettings;

// Configuration layers, lowest to highest priority:
//
//   struct defaults
//   rover-relay.toml     [bus]
//                        url = "wss://push.example.com/ws"
//   env vars             ROVER_BUS__URL=...   (double underscore = nesting)

pub const DEFAULT_CONFIG_FILE: &str = "rover-relay.toml";

/// Top-level configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub bus: BusFileConfig,
    #[serde(default)]
    pub data: DataFileConfig,
    #[serde(default)]
    pub storage: StorageFileConfig,
    #[serde(default)]
    pub media: MediaFileConfig,
}

/// Message bus connection (lives under `[bus]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusFileConfig {
    #[serde(default = "default_bus_url")]
    pub url: String,
    /// Realm the device authenticates into; sent as `realm` on connect.
    #[serde(default)]
    pub access_key: String,
    #[serde(default = "default_open_delay_ms")]
    pub open_delay_ms: u64,
}

impl Default for BusFileConfig {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            access_key: String::new(),
            open_delay_ms: default_open_delay_ms(),
        }
    }
}

/// Data endpoint for transfers (lives under `[data]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataFileConfig {
    #[serde(default = "default_data_url")]
    pub url: String,
}

impl Default for DataFileConfig {
    fn default() -> Self {
        Self {
            url: default_data_url(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageFileConfig {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
}

impl Default for StorageFileConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaFileConfig {
    #[serde(default = "default_camera_width")]
    pub camera_width: u32,
    #[serde(default = "default_camera_height")]
    pub camera_height: u32,
    #[serde(default = "default_camera_fps")]
    pub camera_fps: u32,
    #[serde(default)]
    pub audio: bool,
}

impl Default for MediaFileConfig {
    fn default() -> Self {
        Self {
            camera_width: default_camera_width(),
            camera_height: default_camera_height(),
            camera_fps: default_camera_fps(),
            audio: false,
        }
    }
}

fn default_bus_url() -> String {
    "ws://127.0.0.1:9000/ws".to_string()
}
fn default_open_delay_ms() -> u64 {
    300
}
fn default_data_url() -> String {
    "http://127.0.0.1:9001".to_string()
}
fn default_credentials_path() -> PathBuf {
    PathBuf::from("rover-credentials.json")
}
fn default_camera_width() -> u32 {
    640
}
fn default_camera_height() -> u32 {
    480
}
fn default_camera_fps() -> u32 {
    30
}

impl BusFileConfig {
    pub fn options(&self) -> BusOptions {
        BusOptions {
            open_delay: Duration::from_millis(self.open_delay_ms),
        }
    }
}

impl MediaFileConfig {
    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            width: self.camera_width,
            height: self.camera_height,
            fps: self.camera_fps,
            audio: self.audio,
        }
    }
}

/// Layer defaults, the TOML file at `path` (if present) and `ROVER_*` env
/// vars.
pub fn load_config(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("ROVER_").split("__"))
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, figment::Error> {
        load_config(path).extract()
    }
}
