use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Result, StoreError};

/// Store configuration, loaded from a TOML file.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Persistence root; each client id gets a directory below it.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Name of the persistence provider ("default", "encrypted", "memory",
    /// or any name registered at start-up).
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Snapshot password, required by the "encrypted" provider.
    #[serde(default)]
    pub password: Option<Zeroizing<String>>,

    /// Where failure diagnostics are written. Defaults to `<root>/errors`.
    #[serde(default)]
    pub diagnostics_dir: Option<PathBuf>,
}

/// Returns the veil data directory (~/.config/veil on Linux, %APPDATA%/veil on Windows).
fn default_root() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("veil")
}

fn default_provider() -> String {
    "default".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            provider: default_provider(),
            password: None,
            diagnostics_dir: None,
        }
    }
}

impl StoreConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| StoreError::Config(e.to_string()))
    }

    pub fn diagnostics_dir(&self) -> PathBuf {
        self.diagnostics_dir
            .clone()
            .unwrap_or_else(|| self.root.join("errors"))
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("root", &self.root)
            .field("provider", &self.provider)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("diagnostics_dir", &self.diagnostics_dir)
            .finish()
    }
}
