//! N-dimensional array resource.
//!
//! An [`NdArray`] owns exactly one engine [`Handle`].  It is created by a
//! [`ResourceScope`] and sits in that scope's live-set until it is closed
//! explicitly or the scope cascades.

use dashmap::DashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, warn};

use crate::dispatch::Dispatcher;
use crate::error::{Result, ScopeError};
use crate::handle::{Handle, ResourceId};
use crate::metrics::ScopeMetrics;
use crate::scope::{Resource, ResourceScope};
use crate::types::{ArrayDesc, DataType, Device, Shape};

/// Host-side primitive that can populate or be read from an array.
pub trait Element: Copy + Send + Sync + 'static {
    /// Engine dtype matching this primitive.
    const DTYPE: DataType;

    fn write_le(self, out: &mut Vec<u8>);

    /// Decode from exactly `DTYPE.num_bytes()` little-endian bytes.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DataType = $dtype;

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_element! {
    f32 => DataType::Float32,
    f64 => DataType::Float64,
    i32 => DataType::Int32,
    i64 => DataType::Int64,
    i8 => DataType::Int8,
    u8 => DataType::Uint8,
}

/// Handles currently wrapped by an unreleased array, keyed by engine so
/// two engines handing out the same address never collide.
static WRAPPED: OnceLock<DashSet<(usize, Handle)>> = OnceLock::new();

fn wrapped() -> &'static DashSet<(usize, Handle)> {
    WRAPPED.get_or_init(DashSet::new)
}

fn engine_key(dispatcher: &Arc<dyn Dispatcher>) -> usize {
    Arc::as_ptr(dispatcher) as *const () as usize
}

/// Returns `true` while some unreleased array wraps `handle` on `dispatcher`.
#[cfg(test)]
pub(crate) fn is_wrapped(dispatcher: &Arc<dyn Dispatcher>, handle: Handle) -> bool {
    wrapped().contains(&(engine_key(dispatcher), handle))
}

/// A lifetime-managed wrapper around one engine handle.
///
/// Release is idempotent.  Dropping the last reference to an array that was
/// never released hands the handle back to the engine, which is the only
/// way arrays created from the root scope are freed unless closed by hand.
pub struct NdArray {
    id: ResourceId,
    handle: Handle,
    owner: Weak<ResourceScope>,
    dispatcher: Arc<dyn Dispatcher>,
    metrics: Arc<ScopeMetrics>,
    desc: OnceLock<ArrayDesc>,
    released: AtomicBool,
}

impl NdArray {
    /// Wrap `handle`.  Fails with `InvalidArgument` if another unreleased
    /// array already wraps the same handle on the same engine.
    pub(crate) fn new(
        owner: &Arc<ResourceScope>,
        handle: Handle,
        desc: Option<ArrayDesc>,
    ) -> Result<Arc<Self>> {
        let dispatcher = owner.dispatcher().clone();
        if !wrapped().insert((engine_key(&dispatcher), handle)) {
            return Err(ScopeError::invalid(format!(
                "{handle:?} is already owned by a live array"
            )));
        }
        let cell = OnceLock::new();
        if let Some(desc) = desc {
            let _ = cell.set(desc);
        }
        owner.metrics().record_array_created();
        Ok(Arc::new(Self {
            id: ResourceId::next(),
            handle,
            owner: Arc::downgrade(owner),
            dispatcher,
            metrics: owner.metrics().clone(),
            desc: cell,
            released: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// The scope this array was created by, if it is still alive.
    pub fn owner(&self) -> Option<Arc<ResourceScope>> {
        self.owner.upgrade()
    }

    /// Device, shape and dtype.  Queried from the engine on first use for
    /// arrays produced by [`ResourceScope::invoke`].
    pub fn desc(&self) -> Result<&ArrayDesc> {
        if let Some(desc) = self.desc.get() {
            return Ok(desc);
        }
        self.ensure_live()?;
        let desc = self.dispatcher.describe(self.handle)?;
        Ok(self.desc.get_or_init(|| desc))
    }

    pub fn shape(&self) -> Result<Shape> {
        self.desc()?
            .shape
            .clone()
            .ok_or_else(|| ScopeError::IllegalState("array has no known shape".into()))
    }

    pub fn dtype(&self) -> Result<DataType> {
        Ok(self.desc()?.dtype)
    }

    pub fn device(&self) -> Result<Device> {
        Ok(self.desc()?.device)
    }

    /// Overwrite the contents from host data of the same element kind.
    pub fn set<T: Element>(&self, data: &[T]) -> Result<()> {
        let dtype = self.dtype()?;
        if dtype != T::DTYPE {
            return Err(ScopeError::invalid(format!(
                "cannot write {} data into a {dtype} array",
                T::DTYPE
            )));
        }
        let expected = self
            .shape()?
            .checked_size()
            .ok_or_else(|| ScopeError::invalid("array shape is too large"))?;
        if data.len() != expected {
            return Err(ScopeError::invalid(format!(
                "expected {expected} elements, got {}",
                data.len()
            )));
        }
        let mut bytes = Vec::with_capacity(data.len() * dtype.num_bytes());
        for v in data {
            v.write_le(&mut bytes);
        }
        self.set_bytes(&bytes)
    }

    /// Overwrite the contents from raw little-endian bytes.
    pub fn set_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_live()?;
        let desc = self.desc()?;
        let expected = desc
            .shape
            .as_ref()
            .map_or(Some(0), |shape| shape.checked_byte_len(desc.dtype))
            .ok_or_else(|| ScopeError::invalid("array shape is too large"))?;
        if bytes.len() != expected {
            return Err(ScopeError::invalid(format!(
                "expected {expected} bytes, got {}",
                bytes.len()
            )));
        }
        self.dispatcher.copy_from_host(self.handle, bytes)?;
        Ok(())
    }

    /// Copy the contents back to the host.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.ensure_live()?;
        let dtype = self.dtype()?;
        if dtype != T::DTYPE {
            return Err(ScopeError::invalid(format!(
                "cannot read a {dtype} array as {}",
                T::DTYPE
            )));
        }
        let bytes = self.dispatcher.copy_to_host(self.handle)?;
        Ok(bytes.chunks_exact(dtype.num_bytes()).map(T::read_le).collect())
    }

    /// Release the handle and leave the owning scope's live-set.
    ///
    /// Safe to call more than once.  Only the first call can return an
    /// engine error.
    pub fn close(&self) -> Result<()> {
        self.release()
    }

    fn leave_owner(&self) {
        // A closing owner clears its live-set itself.
        if let Some(owner) = self.owner.upgrade().filter(|owner| owner.is_open()) {
            if let Err(err) = owner.detach(self.id) {
                debug!(array = %self.id, %err, "Owner closed before array");
            }
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(ScopeError::closed("NdArray"));
        }
        Ok(())
    }
}

impl Resource for NdArray {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let freed = self.dispatcher.free(self.handle);
        wrapped().remove(&(engine_key(&self.dispatcher), self.handle));
        self.leave_owner();
        match freed {
            Ok(()) => {
                self.metrics.record_array_released();
                debug!(array = %self.id, handle = ?self.handle, "Array released");
                Ok(())
            }
            Err(err) => {
                self.metrics.record_release_failure();
                Err(err.into())
            }
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for NdArray {
    fn drop(&mut self) {
        if !self.is_released() {
            debug!(array = %self.id, "Releasing unreferenced array on drop");
            if let Err(err) = self.release() {
                warn!(array = %self.id, %err, "Failed to release array on drop");
            }
        }
    }
}

impl fmt::Debug for NdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdArray")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("desc", &self.desc.get())
            .field("released", &self.is_released())
            .finish()
    }
}
