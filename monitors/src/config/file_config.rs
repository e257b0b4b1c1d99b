use anyhow::{anyhow, Context};
use serde::Deserialize;
use serde_default::DefaultFromSerde;
use std::{fs, io::ErrorKind, path::PathBuf, time::Duration};

use crate::bus::BusKind;
use crate::config::defaults;

pub fn default_config() -> String {
    format!(
        r#"# The commented values are the defaults on the file creation
[idle]
# How long idle alarms are ignored after the user comes back.
# suppress-timeout-ms = {}

# Idle alarms, each fires once per idle period. The id 0 is reserved.
# [[idle.alarms]]
# id = 1
# timeout-seconds = {}

# Services to follow. With a path and an interface a proxy is kept for the service,
# without them only its presence is watched.
# [[services]]
# bus = "system"
# name = "org.freedesktop.UPower"
# path = "/org/freedesktop/UPower"
# interface = "org.freedesktop.UPower"
#
# [[services]]
# bus = "session"
# name = "org.gnome.ScreenSaver"
"#,
        defaults::suppress_timeout_ms(),
        defaults::idle_timeout_seconds(),
    )
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct AlarmConfig {
    pub id: u32,
    pub timeout_seconds: u32,
}

impl AlarmConfig {
    pub fn get_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_seconds))
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub bus: BusKind,
    pub name: String,
    pub path: Option<String>,
    pub interface: Option<String>,
}

impl ServiceConfig {
    /// Path and interface for a proxy, or `None` when only presence is watched.
    pub fn endpoint(&self) -> Option<(&str, &str)> {
        match (&self.path, &self.interface) {
            (Some(path), Some(interface)) => Some((path, interface)),
            _ => None,
        }
    }
}

#[derive(Deserialize, DefaultFromSerde)]
#[serde(rename_all = "kebab-case")]
pub struct IdleConfig {
    #[serde(default = "defaults::suppress_timeout_ms")]
    pub suppress_timeout_ms: u32,
    #[serde(default = "defaults::alarms")]
    pub alarms: Vec<AlarmConfig>,
}

impl IdleConfig {
    pub fn get_suppress_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.suppress_timeout_ms))
    }
}

#[derive(Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub idle: IdleConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub config_file: PathBuf,
}

impl FileConfig {
    pub fn new(config_override: Option<PathBuf>) -> anyhow::Result<Self> {
        let is_config_overridden = config_override.is_some();
        let config_path = if let Some(config_override) = config_override {
            if let Ok(relative) = config_override.strip_prefix("~") {
                dirs::home_dir()
                    .ok_or(anyhow!("Home directory is not found"))?
                    .join(relative)
            } else {
                config_override
            }
        } else {
            let mut system_config_path: PathBuf =
                dirs::config_dir().ok_or(anyhow!("Config directory is unknown"))?;
            system_config_path.push("pmwatch");
            system_config_path.push("config.toml");

            system_config_path
        };

        let mut config = if fs::metadata(&config_path).is_ok() {
            debug!("Reading config at {}", config_path.display());
            let config_content = std::fs::read_to_string(&config_path).with_context(|| {
                format!("Impossible to read config file {}", config_path.display())
            })?;

            toml::from_str(&config_content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))?
        } else {
            if is_config_overridden {
                anyhow::bail!("Config file is not accessible at {}", config_path.display());
            }
            if let Some(parent) = config_path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    if e.kind() != ErrorKind::AlreadyExists {
                        Err(e)?;
                    }
                }
            }
            debug!("Creating config at {}", config_path.display());
            std::fs::write(&config_path, default_config())?;

            Self::default()
        };
        config.config_file = config_path;

        Ok(config)
    }
}
