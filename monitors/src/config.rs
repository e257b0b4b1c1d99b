pub mod defaults;
mod file_config;

pub use file_config::{AlarmConfig, FileConfig, ServiceConfig};
use std::time::Duration;

pub struct Config {
    pub suppress_timeout: Duration,
    pub alarms: Vec<AlarmConfig>,
    pub services: Vec<ServiceConfig>,
}

impl From<FileConfig> for Config {
    fn from(config: FileConfig) -> Self {
        Self {
            suppress_timeout: config.idle.get_suppress_timeout(),
            alarms: config.idle.alarms,
            services: config.services,
        }
    }
}
