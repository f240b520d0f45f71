//! Server configuration loaded from a YAML file.
//!
//! A missing file is created with defaults so a fresh deployment can start
//! with `tempolink-server` and edit the generated file afterwards.

use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind; the default IPv6 wildcard accepts v4 and v6 on
    /// platforms that dual-stack by default.
    pub bind_ip: String,
    pub port: u16,
    /// Capacity of a room's player list. Monitors do not count against it.
    pub room_max_players: usize,
    /// User ids allowed to join rooms as monitors.
    pub monitors: Vec<i32>,
    /// When set, rooms created with cycling enabled use vote-based chart
    /// selection instead of plain host rotation.
    pub cycle_voting: bool,
    /// Base URL of the identity/chart/record HTTP service.
    pub api_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: "::".to_string(),
            port: 12346,
            room_max_players: 8,
            monitors: Vec::new(),
            cycle_voting: false,
            api_url: "http://localhost:8080".to_string(),
        }
    }
}

impl ServerConfig {
    /// Loads the configuration, writing a default file first if none exists.
    pub fn load(path: &Path) -> Result<Self, String> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
            serde_yaml::from_str(&content)
                .map_err(|e| format!("failed to parse {}: {e}", path.display()))
        } else {
            let config = Self::default();
            config.save(path)?;
            info!("created default configuration at {}", path.display());
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| format!("failed to serialize configuration: {e}"))?;
        fs::write(path, yaml).map_err(|e| format!("failed to write {}: {e}", path.display()))
    }
}
