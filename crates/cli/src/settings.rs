//! Persisted user settings.
//!
//! Only what a user picks (the video and which device to drive) is stored;
//! protocol constants stay in code. Command-line flags override every
//! stored value.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const APP_DIRECTORY_NAME: &str = "splashstream";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub current_video: Option<PathBuf>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub report_id: Option<u8>,
    pub speed: Option<f64>,
}

/// `$XDG_CONFIG_HOME/splashstream/config.json`, falling back to
/// `~/.config/splashstream/config.json`.
pub fn default_path() -> Option<PathBuf> {
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(std::env::var_os("HOME")?).join(".config"),
    };
    Some(base.join(APP_DIRECTORY_NAME).join(CONFIG_FILE_NAME))
}

impl Settings {
    /// Read settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), "settings saved");
        Ok(())
    }
}
