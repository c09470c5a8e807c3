//! Application settings storage.
//!
//! The encoded queue lives under the `queue` key of a small JSON settings
//! document, next to the few preferences the front-end keeps between
//! sessions. File writes go through a temp file and a rename so a crash
//! never leaves a half-written document behind.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::models::error::{StorageError, StorageResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub format_version: u32,
    #[serde(default)]
    pub queue: String,
    #[serde(default = "default_redirect_output")]
    pub redirect_output: bool,
    #[serde(default)]
    pub last_path: Option<PathBuf>,
}

impl Settings {
    pub const FORMAT_VERSION: u32 = 1;
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            format_version: Self::FORMAT_VERSION,
            queue: String::new(),
            redirect_output: default_redirect_output(),
            last_path: None,
        }
    }
}

fn default_redirect_output() -> bool {
    true
}

pub trait StateStore: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Returns `None` on first run, when nothing has been saved yet.
    fn load(&self) -> StorageResult<Option<Settings>>;

    fn save(&self, settings: &Settings) -> StorageResult<()>;
}

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for FileStore {
    fn name(&self) -> &str {
        "FileStore"
    }

    fn load(&self) -> StorageResult<Option<Settings>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let settings: Settings = serde_json::from_reader(reader)?;
        if settings.format_version != Settings::FORMAT_VERSION {
            return Err(StorageError::UnsupportedVersion {
                found: settings.format_version,
                expected: Settings::FORMAT_VERSION,
            });
        }
        Ok(Some(settings))
    }

    fn save(&self, settings: &Settings) -> StorageResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.temp_path();
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            serde_json::to_writer_pretty(&mut writer, settings)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        debug!("Saved settings to {}.", self.path.display());
        Ok(())
    }
}

/// Keeps settings in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    settings: Mutex<Option<Settings>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            settings: Mutex::new(Some(settings)),
        }
    }

    pub fn snapshot(&self) -> Option<Settings> {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StateStore for MemoryStore {
    fn name(&self) -> &str {
        "MemoryStore"
    }

    fn load(&self) -> StorageResult<Option<Settings>> {
        Ok(self.snapshot())
    }

    fn save(&self, settings: &Settings) -> StorageResult<()> {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = Some(settings.clone());
        Ok(())
    }
}
