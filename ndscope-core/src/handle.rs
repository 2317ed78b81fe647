//! Opaque engine handles and live-set keys.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// An opaque reference to engine-allocated memory.
///
/// Identity is the native address.  A `Handle` carries no lifetime logic;
/// whoever wraps it in a [`Resource`](crate::Resource) is responsible for
/// handing it back to the engine exactly once.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroUsize);

impl Handle {
    /// Wrap a native address.  Returns `None` for null.
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    /// Wrap a raw pointer returned by the engine.
    pub fn from_ptr(ptr: *mut libc::c_void) -> Option<Self> {
        Self::from_addr(ptr as usize)
    }

    pub fn addr(self) -> usize {
        self.0.get()
    }

    pub fn as_ptr(self) -> *mut libc::c_void {
        self.0.get() as *mut libc::c_void
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

/// Key under which a resource sits in a scope's live-set.
///
/// Ids come from a process-wide counter and are never reused, so two
/// resources never collide even when the engine recycles an address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(u64);

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

impl ResourceId {
    pub(crate) fn next() -> Self {
        Self(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({})", self.0)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
