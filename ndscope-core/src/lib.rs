//! ndscope Core - hierarchical lifetime management for native arrays
//!
//! Every native array handle is owned by exactly one [`ResourceScope`].
//! Scopes form a tree rooted at a process-wide root scope; closing a scope
//! releases everything it tracks, nested scopes included, exactly once.
//!
//! # Design:
//! - Synchronous, thread-safe scopes shared through `Arc`
//! - Concurrent live-sets, one lifecycle lock per scope
//! - Pluggable [`Dispatcher`] between the scope tree and the compute engine

pub mod array;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ffi;
pub mod handle;
pub mod metrics;
pub mod params;
pub mod scope;
pub mod types;

pub use array::{Element, NdArray};
pub use config::EngineConfig;
pub use dispatch::{Dispatcher, DispatcherRegistry, HostEngine};
pub use error::{DispatchError, ReleaseFailure, Result, ScopeError};
pub use ffi::EngineLibrary;
pub use handle::{Handle, ResourceId};
pub use metrics::{MetricsSnapshot, ScopeMetrics};
pub use params::{OpParams, ParamValue};
pub use scope::{CloseReport, ReleaseObserver, Resource, ResourceScope, SubScopeOptions};
pub use types::{ArrayDesc, DataType, Device, DeviceType, Shape};

use anyhow::Context;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `config.log_level`.  Calling this again after a
/// subscriber is installed is a no-op.
pub fn init(config: &EngineConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .with_context(|| format!("Invalid log filter '{}'", config.log_level))?,
    };

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        debug!("Tracing subscriber already installed");
        return Ok(());
    }

    info!("Initializing ndscope v{}", env!("CARGO_PKG_VERSION"));
    info!(device = %config.default_device, "Default device");
    Ok(())
}
