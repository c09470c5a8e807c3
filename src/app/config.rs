use std::{env, path::PathBuf, time::Duration};

use log::warn;

use crate::persistence::autosave::DEFAULT_SAVE_DELAY;

pub const SETTINGS_ENV: &str = "QUEUER_SETTINGS";
pub const SAVE_DELAY_ENV: &str = "QUEUER_SAVE_DELAY_SECS";

const APP_DIR: &str = "program-queuer";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub settings_path: PathBuf,
    pub save_delay: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let settings_path = lookup(SETTINGS_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| default_settings_path(&lookup));

        let save_delay = match lookup(SAVE_DELAY_ENV) {
            Some(value) => match value.trim().parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(_) => {
                    warn!("Ignoring invalid {}={:?}.", SAVE_DELAY_ENV, value);
                    DEFAULT_SAVE_DELAY
                }
            },
            None => DEFAULT_SAVE_DELAY,
        };

        Config {
            settings_path,
            save_delay,
        }
    }
}

fn default_settings_path(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(config_home) = lookup("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(config_home).join(APP_DIR).join(SETTINGS_FILE);
    }
    if let Some(home) = lookup("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join(SETTINGS_FILE);
    }
    PathBuf::from(format!("{APP_DIR}.json"))
}
