//! Engine configuration.
//!
//! Resolution order: built-in defaults, then the JSON file named by
//! `NDSCOPE_CONFIG`, then individual `NDSCOPE_*` variables.  Bad values are
//! logged and ignored so a typo never prevents the root scope from coming
//! up.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::dispatch::{Dispatcher, HostEngine};
use crate::ffi::EngineLibrary;
use crate::types::Device;

pub const CONFIG_ENV: &str = "NDSCOPE_CONFIG";
pub const DEVICE_ENV: &str = "NDSCOPE_DEVICE";
pub const ENGINE_LIB_ENV: &str = "NDSCOPE_ENGINE_LIB";
pub const LOG_ENV: &str = "NDSCOPE_LOG";
pub const SEED_ENV: &str = "NDSCOPE_SEED";

/// Settings for the root scope and its engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Device for arrays created without an explicit one.
    pub default_device: Device,
    /// Native engine shared library.  `None` selects the host engine.
    pub engine_library: Option<PathBuf>,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Seed for the host engine's sampling operators.
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_device: Device::cpu(),
            engine_library: None,
            log_level: "info".to_string(),
            seed: None,
        }
    }
}

impl EngineConfig {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Self {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)).unwrap_or_else(|err| {
                warn!(error = %format!("{err:#}"), "Ignoring config file");
                Self::default()
            }),
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Load a JSON configuration file.  Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    /// Apply `NDSCOPE_*` overrides obtained through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(DEVICE_ENV) {
            match raw.parse::<Device>() {
                Ok(device) => self.default_device = device,
                Err(err) => warn!(%raw, %err, "Ignoring {DEVICE_ENV}"),
            }
        }
        if let Some(raw) = lookup(ENGINE_LIB_ENV) {
            self.engine_library = (!raw.trim().is_empty()).then(|| PathBuf::from(raw));
        }
        if let Some(raw) = lookup(LOG_ENV) {
            self.log_level = raw;
        }
        if let Some(raw) = lookup(SEED_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(seed) => self.seed = Some(seed),
                Err(err) => warn!(%raw, %err, "Ignoring {SEED_ENV}"),
            }
        }
    }

    /// Build the dispatcher this configuration selects.
    ///
    /// A library that fails to load falls back to the host engine.
    pub fn build_dispatcher(&self) -> Arc<dyn Dispatcher> {
        if let Some(path) = &self.engine_library {
            match EngineLibrary::load(path) {
                Ok(library) => return Arc::new(library),
                Err(err) => warn!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "Falling back to host engine"
                ),
            }
        }
        match self.seed {
            Some(seed) => Arc::new(HostEngine::with_seed(seed)),
            None => Arc::new(HostEngine::new()),
        }
    }
}
