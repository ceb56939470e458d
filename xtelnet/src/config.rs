//! Per-session configuration.
//!
//! Loaded from an optional TOML file (the `new --file` flag) with
//! `serde`/`toml`, the way `shell-pool-shpool` loads its own daemon config —
//! a plain `#[derive(Deserialize)]` struct with `#[serde(default)]` fields,
//! no bespoke parser.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

fn default_scrollback_cap() -> usize {
    500
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    30
}

/// Raw on-disk shape; see [`SessionConfig`] for the form the rest of the
/// crate uses (durations instead of raw seconds).
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawConfig {
    scrollback_cap: usize,
    keepalive_secs: u64,
    connect_timeout_secs: u64,
    runtime_dir: Option<PathBuf>,
    debug_iac: bool,
    ga_visible: bool,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            scrollback_cap: default_scrollback_cap(),
            keepalive_secs: default_keepalive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            runtime_dir: None,
            debug_iac: false,
            ga_visible: false,
        }
    }
}

/// Tunables for one session: scrollback depth, keep-alive cadence, connect
/// timeout, where the local control socket lives, and the two `/debug`
/// toggles.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub scrollback_cap: usize,
    pub keepalive: Duration,
    pub connect_timeout: Duration,
    pub runtime_dir: Option<PathBuf>,
    pub debug_iac: bool,
    pub ga_visible: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        RawConfig::default().into()
    }
}

impl From<RawConfig> for SessionConfig {
    fn from(raw: RawConfig) -> Self {
        Self {
            scrollback_cap: raw.scrollback_cap,
            keepalive: Duration::from_secs(raw.keepalive_secs),
            connect_timeout: Duration::from_secs(raw.connect_timeout_secs),
            runtime_dir: raw.runtime_dir,
            debug_iac: raw.debug_iac,
            ga_visible: raw.ga_visible,
        }
    }
}

impl SessionConfig {
    /// Defaults, as used when `new` is invoked without `--file`.
    pub fn load_default() -> Self {
        Self::default()
    }

    /// Parse a TOML config file. Missing fields fall back to their defaults.
    pub fn load_file(path: &std::path::Path) -> Result<Self, crate::error::XtelnetError> {
        let text = std::fs::read_to_string(path).map_err(crate::error::XtelnetError::UiIoError)?;
        let raw: RawConfig = toml::from_str(&text)
            .map_err(|e| crate::error::XtelnetError::CommandMalformed(format!("invalid config: {e}")))?;
        Ok(raw.into())
    }

    /// Resolve the directory that holds per-session runtime state (the Unix
    /// socket, pidfile), falling back to the OS cache dir under an
    /// `xtelnet` subdirectory.
    pub fn resolve_runtime_dir(&self) -> PathBuf {
        self.runtime_dir.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("", "", "xtelnet")
                .map(|d| d.cache_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from("/tmp/xtelnet"))
        })
    }
}
