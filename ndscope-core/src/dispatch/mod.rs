//! Dispatch Service - the boundary to the native compute engine
//!
//! The scope tree never interprets operator semantics.  It hands an
//! operation name, input handles and typed parameters to a [`Dispatcher`]
//! and tracks whatever handles come back.
//!
//! # Implementations:
//! - [`HostEngine`]: in-process reference engine backed by host memory
//! - [`EngineLibrary`](crate::ffi::EngineLibrary): a native engine loaded
//!   from a shared library at runtime

pub mod host;

pub use host::HostEngine;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DispatchError;
use crate::handle::Handle;
use crate::params::OpParams;
use crate::types::{ArrayDesc, DataType, Device, Shape};

/// Operation-execution service that turns named operations into handles.
///
/// Every method is a single synchronous call; retry policy, if any, lives
/// inside the implementation.  Implementations must be safe to call from
/// many threads at once.
pub trait Dispatcher: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Allocate an uninitialized array.
    fn create(
        &self,
        device: Device,
        shape: &Shape,
        dtype: DataType,
    ) -> Result<Handle, DispatchError>;

    /// Run `operation` and return freshly allocated outputs.
    fn invoke(
        &self,
        operation: &str,
        inputs: &[Handle],
        params: &OpParams,
    ) -> Result<Vec<Handle>, DispatchError>;

    /// Run `operation`, writing into caller-provided outputs.
    fn invoke_into(
        &self,
        operation: &str,
        inputs: &[Handle],
        outputs: &[Handle],
        params: &OpParams,
    ) -> Result<(), DispatchError>;

    /// Query device, shape and dtype of a live handle.
    fn describe(&self, handle: Handle) -> Result<ArrayDesc, DispatchError>;

    /// Overwrite the array's contents with little-endian host bytes.
    fn copy_from_host(&self, handle: Handle, bytes: &[u8]) -> Result<(), DispatchError>;

    /// Read the array's contents back as little-endian bytes.
    fn copy_to_host(&self, handle: Handle) -> Result<Vec<u8>, DispatchError>;

    /// Return the handle's memory to the engine.
    fn free(&self, handle: Handle) -> Result<(), DispatchError>;
}

/// Thread-safe registry of named dispatchers.
///
/// Lets a process keep several engines around (for example a host engine
/// for tests next to a native one) and pick one per scope subtree.
pub struct DispatcherRegistry {
    dispatchers: Arc<RwLock<HashMap<String, Arc<dyn Dispatcher>>>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self {
            dispatchers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a dispatcher under `name`, replacing any previous entry.
    pub fn register(&self, name: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) {
        self.dispatchers.write().insert(name.into(), dispatcher);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Dispatcher>> {
        self.dispatchers.read().get(name).cloned()
    }

    /// Remove a dispatcher by name, returning it if it existed.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn Dispatcher>> {
        self.dispatchers.write().remove(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.dispatchers.read().keys().cloned().collect()
    }
}

impl Default for DispatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for DispatcherRegistry {
    fn clone(&self) -> Self {
        Self {
            dispatchers: self.dispatchers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_and_get() {
        let registry = DispatcherRegistry::new();
        registry.register("host", Arc::new(HostEngine::new()));
        assert!(registry.get("host").is_some());
        assert!(registry.get("native").is_none());
        assert_eq!(registry.list(), vec!["host".to_string()]);
    }

    #[test]
    fn test_registry_remove() {
        let registry = DispatcherRegistry::new();
        registry.register("host", Arc::new(HostEngine::new()));
        assert!(registry.remove("host").is_some());
        assert!(registry.remove("host").is_none());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_registry_threaded_access() {
        let registry = DispatcherRegistry::default();
        registry.register("host", Arc::new(HostEngine::new()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let reg = registry.clone();
            handles.push(std::thread::spawn(move || {
                assert!(reg.get("host").is_some());
                reg.register(format!("host-{i}"), Arc::new(HostEngine::new()));
            }));
        }
        for h in handles {
            h.join().expect("thread panicked");
        }
        assert_eq!(registry.list().len(), 9);
    }
}
