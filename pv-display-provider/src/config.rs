//! Process-wide session configuration: ring-buffer page counts and the
//! default control port. Passed explicitly into session constructors rather
//! than read from a global.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error while accessing `{path}`: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// IVC page size assumed when sizing ring buffers from a page count.
pub const PAGE_SIZE: u32 = 4096;

/// Default control-channel port.
pub const DEFAULT_CONTROL_PORT: u32 = 1000;

/// Ring-buffer page counts for a session, loadable from a `[rings]` TOML
/// table.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RingPages {
    pub control: u32,
    pub event: u32,
    pub dirty_rectangles: u32,
    /// Fixed cursor geometry (64x64 ARGB8888, 16,384 B) never changes, so
    /// this is effectively constant; kept configurable for symmetry with the
    /// other channels and to tolerate a future page-size change.
    pub cursor: u32,
}

impl Default for RingPages {
    fn default() -> Self {
        Self {
            control: 1,
            event: 4,
            dirty_rectangles: 32,
            cursor: pages_for(16_384),
        }
    }
}

/// Computes `ceil(bytes / PAGE_SIZE) + 1` (data pages plus one metadata page),
/// the allocation rule used for framebuffer and cursor buffers.
pub fn pages_for(bytes: u32) -> u32 {
    bytes.div_ceil(PAGE_SIZE) + 1
}

/// Top-level session configuration: control port plus ring-buffer sizing.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    #[serde(default = "default_control_port")]
    pub control_port: u32,
    #[serde(default)]
    pub rings: RingPages,
}

fn default_control_port() -> u32 {
    DEFAULT_CONTROL_PORT
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            control_port: DEFAULT_CONTROL_PORT,
            rings: RingPages::default(),
        }
    }
}

impl SessionConfig {
    /// Loads and validates a `SessionConfig` from a TOML file. Sessions are
    /// created once per connection, so no file-watcher/hot-reload is
    /// needed — a plain load suffices.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_str(&s)
    }

    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: SessionConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.control_port == 0 {
            return Err(ConfigError::Validation(
                "control_port must be nonzero".into(),
            ));
        }
        if self.rings.control == 0 {
            return Err(ConfigError::Validation(
                "rings.control must be at least 1 page".into(),
            ));
        }
        if self.rings.event == 0 {
            return Err(ConfigError::Validation(
                "rings.event must be at least 1 page".into(),
            ));
        }
        Ok(())
    }
}
