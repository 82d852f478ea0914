//! Konfiguration
//!
//! `calls.toml` im Konfigurationsverzeichnis der Plattform, danach
//! Umgebungsvariablen (`CALLS_ENABLED`, `CALLS_DATABASE`).

use anyhow::{ensure, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "calls.toml";
const DATABASE_FILE: &str = "calls.db";

/// Konfiguration des Anruf-Subsystems
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Feature-Flag für das gesamte Subsystem
    pub enabled: bool,
    /// Ring-Timeout des Anrufers (entspricht der Push-TTL)
    pub ring_timeout_secs: u64,
    /// Zusätzliche Wartezeit, bevor ein eingehender Anruf lokal abläuft
    pub incoming_grace_secs: u64,
    pub route_enforce_interval_ms: u64,
    pub room_retry_attempts: u32,
    pub room_retry_delay_ms: u64,
    pub presence_online_window_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Anzahl gemerkter beendeter `call_id`s
    pub finished_call_memory: usize,
    pub database_path: Option<PathBuf>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ring_timeout_secs: 30,
            incoming_grace_secs: 5,
            route_enforce_interval_ms: 250,
            room_retry_attempts: 3,
            room_retry_delay_ms: 500,
            presence_online_window_secs: 60,
            heartbeat_interval_secs: 25,
            finished_call_memory: 64,
            database_path: None,
        }
    }
}

impl CallConfig {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "callcore", "callcore")
            .context("Could not determine app directories")
    }

    /// Lädt die Konfiguration von Disk (fehlende Datei = Defaults) und wendet die Umgebung an
    pub fn load() -> Result<Self> {
        let path = Self::project_dirs()?.config_dir().join(CONFIG_FILE);
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Perioden und Timeouts müssen größer als null sein
    pub fn validate(&self) -> Result<()> {
        ensure!(self.ring_timeout_secs > 0, "ring_timeout_secs must be greater than 0");
        ensure!(
            self.route_enforce_interval_ms > 0,
            "route_enforce_interval_ms must be greater than 0"
        );
        ensure!(
            self.heartbeat_interval_secs > 0,
            "heartbeat_interval_secs must be greater than 0"
        );
        ensure!(
            self.presence_online_window_secs > 0,
            "presence_online_window_secs must be greater than 0"
        );
        Ok(())
    }

    /// Umgebungsvariablen überschreiben die Datei
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("CALLS_ENABLED") {
            self.enabled = parse_flag(&value)
                .with_context(|| format!("Invalid CALLS_ENABLED value: {value}"))?;
        }
        if let Some(value) = lookup("CALLS_DATABASE") {
            if !value.is_empty() {
                self.database_path = Some(PathBuf::from(value));
            }
        }
        Ok(())
    }

    /// Datenbank-Pfad (Default im Datenverzeichnis der Plattform)
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::project_dirs()?.data_dir().join(DATABASE_FILE)),
        }
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    /// Lokales Ablaufen eines eingehenden Anrufs
    pub fn incoming_expiry(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs + self.incoming_grace_secs)
    }

    pub fn route_enforce_interval(&self) -> Duration {
        Duration::from_millis(self.route_enforce_interval_ms)
    }

    pub fn room_retry_delay(&self) -> Duration {
        Duration::from_millis(self.room_retry_delay_ms)
    }

    pub fn presence_online_window(&self) -> Duration {
        Duration::from_secs(self.presence_online_window_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
