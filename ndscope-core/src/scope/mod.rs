//! Resource Scopes - hierarchical ownership of native arrays
//!
//! Every array handle is reachable from exactly one [`ResourceScope`].
//! Closing a scope releases everything it owns, including nested scopes,
//! which in turn release their own arrays.  A single process-wide root
//! scope sits at the top of the tree; it never closes and tracks nothing,
//! so anything created directly from it is the caller's to release.
//!
//! # Locking
//! Each child scope serializes `attach`, `detach` and `close` behind one
//! mutex.  The closed flag is read before the mutex is taken and again
//! under it.  The first read lets a scope that is mid-cascade reject
//! re-entrant calls from its own children without deadlocking; the second
//! closes the window between the check and the insert.  A closing scope
//! leaves its parent only after dropping its own mutex, so a child and its
//! parent never wait on each other.
//!
//! The live-set is a concurrent map so lookups and counts never block,
//! but mutation still goes through the mutex above.

pub mod factory;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, DispatcherRegistry};
use crate::error::{DispatchError, ReleaseFailure, Result, ScopeError};
use crate::handle::ResourceId;
use crate::metrics::ScopeMetrics;
use crate::types::Device;

/// Anything a scope can own and release.
pub trait Resource: Send + Sync {
    /// Live-set key.  Unique for the life of the process.
    fn id(&self) -> ResourceId;

    /// Give the underlying memory back.  Idempotent: calls after the first
    /// are no-ops that return `Ok`.
    fn release(&self) -> Result<()>;

    fn is_released(&self) -> bool;
}

impl fmt::Debug for dyn Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Called after a scope finishes closing, with what went wrong.
pub type ReleaseObserver = Arc<dyn Fn(&CloseReport) + Send + Sync>;

/// Outcome of the call that actually closed a scope.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseReport {
    pub scope: ResourceId,
    /// Live-set entries released without error.
    pub released: usize,
    /// Entries whose release failed.  They are no longer tracked.
    pub failures: Vec<ReleaseFailure>,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Overrides for [`ResourceScope::new_sub_scope_with`].  Anything left as
/// `None` is inherited from the parent.
#[derive(Default, Clone)]
pub struct SubScopeOptions {
    pub device: Option<Device>,
    pub dispatcher: Option<Arc<dyn Dispatcher>>,
    /// Name looked up in [`ResourceScope::engines`].  Ignored when
    /// `dispatcher` is set.
    pub engine: Option<String>,
    pub observer: Option<ReleaseObserver>,
}

impl SubScopeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Route the new subtree to a different engine.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Route the new subtree to the engine registered under `name`.
    pub fn engine(mut self, name: impl Into<String>) -> Self {
        self.engine = Some(name.into());
        self
    }

    pub fn observer(mut self, observer: impl Fn(&CloseReport) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }
}

/// A node in the ownership tree.
pub struct ResourceScope {
    id: ResourceId,
    device: Device,
    dispatcher: Arc<dyn Dispatcher>,
    engines: DispatcherRegistry,
    metrics: Arc<ScopeMetrics>,
    kind: ScopeKind,
}

enum ScopeKind {
    /// Parentless, never closes, tracks nothing.
    Root,
    Child(ChildState),
}

struct ChildState {
    parent: Weak<ResourceScope>,
    live: DashMap<ResourceId, Arc<dyn Resource>>,
    closed: AtomicBool,
    lifecycle: Mutex<()>,
    observer: Option<ReleaseObserver>,
}

static ROOT: OnceLock<Arc<ResourceScope>> = OnceLock::new();

impl ResourceScope {
    /// The process-wide root scope.
    ///
    /// Built on first use from [`EngineConfig::from_env`] unless
    /// [`install_root`](Self::install_root) ran first.
    ///
    /// Arrays and scopes created directly from the root are never released
    /// automatically.  Close them by hand (or let the last reference drop);
    /// forgetting to do so leaks native memory for the life of the process.
    pub fn root() -> &'static Arc<ResourceScope> {
        ROOT.get_or_init(|| Self::new_root(&EngineConfig::from_env()))
    }

    /// Build the root scope from an explicit configuration.
    ///
    /// Fails with `IllegalState` if the root already exists.
    pub fn install_root(config: &EngineConfig) -> Result<&'static Arc<ResourceScope>> {
        let mut installed = false;
        let root = ROOT.get_or_init(|| {
            installed = true;
            Self::new_root(config)
        });
        if installed {
            Ok(root)
        } else {
            Err(ScopeError::IllegalState("root scope is already initialized".into()))
        }
    }

    fn new_root(config: &EngineConfig) -> Arc<ResourceScope> {
        let dispatcher = config.build_dispatcher();
        let engines = DispatcherRegistry::new();
        engines.register(dispatcher.name(), dispatcher.clone());
        info!(
            engine = dispatcher.name(),
            device = %config.default_device,
            "Initializing root scope"
        );
        Arc::new(Self {
            id: ResourceId::next(),
            device: config.default_device,
            dispatcher,
            engines,
            metrics: ScopeMetrics::new(),
            kind: ScopeKind::Root,
        })
    }

    /// Open a nested scope on `device` (or this scope's device).
    pub fn new_sub_scope(self: &Arc<Self>, device: Option<Device>) -> Result<Arc<ResourceScope>> {
        self.new_sub_scope_with(SubScopeOptions {
            device,
            ..SubScopeOptions::default()
        })
    }

    /// Open a nested scope with explicit overrides.
    ///
    /// The new scope is attached to `self`, so closing `self` closes it.
    /// Fails with `InvalidArgument` if `options.engine` names an engine
    /// that is not registered.
    pub fn new_sub_scope_with(
        self: &Arc<Self>,
        options: SubScopeOptions,
    ) -> Result<Arc<ResourceScope>> {
        self.ensure_open()?;
        let dispatcher = match (options.dispatcher, &options.engine) {
            (Some(dispatcher), _) => dispatcher,
            (None, Some(name)) => self.engines.get(name).ok_or_else(|| {
                ScopeError::invalid(format!("no engine registered as `{name}`"))
            })?,
            (None, None) => self.dispatcher.clone(),
        };
        let inherited = match &self.kind {
            ScopeKind::Root => None,
            ScopeKind::Child(state) => state.observer.clone(),
        };
        let child = Arc::new(Self {
            id: ResourceId::next(),
            device: options.device.unwrap_or(self.device),
            dispatcher,
            engines: self.engines.clone(),
            metrics: self.metrics.clone(),
            kind: ScopeKind::Child(ChildState {
                parent: Arc::downgrade(self),
                live: DashMap::new(),
                closed: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
                observer: options.observer.or(inherited),
            }),
        });
        self.attach(child.clone())?;
        self.metrics.record_scope_opened();
        debug!(
            parent = %self.id,
            scope = %child.id,
            device = %child.device,
            engine = child.dispatcher.name(),
            "Opened sub-scope"
        );
        Ok(child)
    }

    /// Put `resource` in this scope's live-set.
    ///
    /// Fails with `IllegalState` once the scope is closed.  A no-op on the
    /// root.
    pub fn attach(&self, resource: Arc<dyn Resource>) -> Result<()> {
        let state = match &self.kind {
            ScopeKind::Root => return Ok(()),
            ScopeKind::Child(state) => state,
        };
        if resource.id() == self.id {
            return Err(ScopeError::invalid("a scope cannot own itself"));
        }
        state.check_open()?;
        let guard = state.lifecycle.lock();
        state.check_open()?;
        let id = resource.id();
        let previous = state.live.insert(id, resource);
        drop(guard);
        // Replaced entries drop outside the lock.
        drop(previous);
        debug!(scope = %self.id, resource = %id, "Attached");
        Ok(())
    }

    /// Remove `id` from the live-set without releasing it.
    ///
    /// The caller takes over responsibility for the returned resource,
    /// either releasing it or attaching it to another scope.  Returns
    /// `None` when `id` was not tracked here.  Fails with `IllegalState`
    /// once the scope is closed.  A no-op on the root.
    pub fn detach(&self, id: ResourceId) -> Result<Option<Arc<dyn Resource>>> {
        let state = match &self.kind {
            ScopeKind::Root => return Ok(None),
            ScopeKind::Child(state) => state,
        };
        state.check_open()?;
        let guard = state.lifecycle.lock();
        state.check_open()?;
        let removed = state.live.remove(&id).map(|(_, r)| r);
        drop(guard);
        if removed.is_some() {
            debug!(scope = %self.id, resource = %id, "Detached");
        }
        Ok(removed)
    }

    /// Release everything this scope owns and leave the parent.
    ///
    /// Idempotent and infallible.  A release that fails does not stop the
    /// cascade; failures are logged and handed to the release observer.
    /// A no-op on the root.
    pub fn close(&self) {
        let _ = self.close_with_report();
    }

    /// Like [`close`](Self::close), but returns the report when this call
    /// performed the close.  Later calls and the root return `None`.
    pub fn close_with_report(&self) -> Option<CloseReport> {
        let state = match &self.kind {
            ScopeKind::Root => {
                debug!("Ignoring close on root scope");
                return None;
            }
            ScopeKind::Child(state) => state,
        };

        let (snapshot, report) = {
            let _guard = state.lifecycle.lock();
            if state
                .closed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return None;
            }
            let snapshot: Vec<Arc<dyn Resource>> =
                state.live.iter().map(|entry| entry.value().clone()).collect();
            let mut failures = Vec::new();
            for resource in &snapshot {
                if let Err(error) = resource.release() {
                    warn!(
                        scope = %self.id,
                        resource = %resource.id(),
                        %error,
                        "Release failed during close, continuing"
                    );
                    failures.push(ReleaseFailure {
                        resource: resource.id(),
                        error,
                    });
                }
            }
            state.live.clear();
            let report = CloseReport {
                scope: self.id,
                released: snapshot.len() - failures.len(),
                failures,
            };
            (snapshot, report)
        };
        drop(snapshot);

        if let Some(parent) = state.parent.upgrade() {
            // A parent that is itself cascading rejects this and clears
            // its own live-set instead.
            if let Err(err) = parent.detach(self.id) {
                debug!(scope = %self.id, parent = %parent.id, %err, "Parent already closing");
            }
        }

        self.metrics.record_scope_closed();
        debug!(
            scope = %self.id,
            released = report.released,
            failed = report.failures.len(),
            "Closed scope"
        );
        if let Some(observer) = &state.observer {
            observer(&report);
        }
        Some(report)
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Default device for arrays created here.
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn parent(&self) -> Option<Arc<ResourceScope>> {
        match &self.kind {
            ScopeKind::Root => None,
            ScopeKind::Child(state) => state.parent.upgrade(),
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self.kind, ScopeKind::Root)
    }

    /// `false` once closed.  The root is always open.
    pub fn is_open(&self) -> bool {
        match &self.kind {
            ScopeKind::Root => true,
            ScopeKind::Child(state) => !state.closed.load(Ordering::Acquire),
        }
    }

    /// Number of live-set entries.  Always zero for the root.
    pub fn live_count(&self) -> usize {
        match &self.kind {
            ScopeKind::Root => 0,
            ScopeKind::Child(state) => state.live.len(),
        }
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        match &self.kind {
            ScopeKind::Root => false,
            ScopeKind::Child(state) => state.live.contains_key(&id),
        }
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    /// Named engines shared by the whole tree.  The root's own engine is
    /// registered under its [`Dispatcher::name`].
    pub fn engines(&self) -> &DispatcherRegistry {
        &self.engines
    }

    /// Counters shared by this scope's whole subtree.
    pub fn metrics(&self) -> &Arc<ScopeMetrics> {
        &self.metrics
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        match &self.kind {
            ScopeKind::Root => Ok(()),
            ScopeKind::Child(state) => state.check_open(),
        }
    }

    /// Run one engine call, timing it into the subtree's metrics.
    pub(crate) fn dispatch<T>(
        &self,
        call: impl FnOnce(&dyn Dispatcher) -> std::result::Result<T, DispatchError>,
    ) -> Result<T> {
        let start = Instant::now();
        let result = call(self.dispatcher.as_ref());
        self.metrics.record_invocation(start.elapsed());
        Ok(result?)
    }
}

impl ChildState {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ScopeError::closed("ResourceScope"));
        }
        Ok(())
    }
}

impl Resource for ResourceScope {
    fn id(&self) -> ResourceId {
        self.id
    }

    /// Closing a scope never fails; nested failures are reported through
    /// the nested scope's own observer.
    fn release(&self) -> Result<()> {
        self.close();
        Ok(())
    }

    fn is_released(&self) -> bool {
        !self.is_open()
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        if let ScopeKind::Child(state) = &self.kind {
            if !state.closed.load(Ordering::Acquire) {
                debug!(scope = %self.id, "Closing unreferenced scope on drop");
                self.close();
            }
        }
    }
}

impl fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceScope")
            .field("id", &self.id)
            .field("root", &self.is_root())
            .field("device", &self.device)
            .field("engine", &self.dispatcher.name())
            .field("open", &self.is_open())
            .field("live", &self.live_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HostEngine;
    use crate::types::{DataType, Shape};
    use std::sync::atomic::AtomicUsize;

    /// A resource that records how often it was released and can fail.
    struct Tracked {
        id: ResourceId,
        releases: AtomicUsize,
        fail: bool,
    }

    impl Tracked {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id: ResourceId::next(),
                releases: AtomicUsize::new(0),
                fail,
            })
        }

        fn releases(&self) -> usize {
            self.releases.load(Ordering::SeqCst)
        }
    }

    impl Resource for Tracked {
        fn id(&self) -> ResourceId {
            self.id
        }

        fn release(&self) -> Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ScopeError::Dispatch(DispatchError::new("free", "boom")));
            }
            Ok(())
        }

        fn is_released(&self) -> bool {
            self.releases() > 0
        }
    }

    fn test_scope() -> Arc<ResourceScope> {
        ResourceScope::root()
            .new_sub_scope_with(SubScopeOptions::new().dispatcher(Arc::new(HostEngine::new())))
            .unwrap()
    }

    #[test]
    fn test_close_is_idempotent() {
        let scope = test_scope();
        let tracked = Tracked::new(false);
        scope.attach(tracked.clone()).unwrap();

        assert!(scope.close_with_report().is_some());
        assert!(scope.close_with_report().is_none());
        scope.close();
        assert_eq!(tracked.releases(), 1);
        assert!(!scope.is_open());
    }

    #[test]
    fn test_failed_release_does_not_stop_cascade() {
        let scope = test_scope();
        let bad = Tracked::new(true);
        let good: Vec<_> = (0..4).map(|_| Tracked::new(false)).collect();
        scope.attach(bad.clone()).unwrap();
        for p in &good {
            scope.attach(p.clone()).unwrap();
        }

        let report = scope.close_with_report().unwrap();
        assert_eq!(report.released, 4);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].resource, bad.id());
        assert!(good.iter().all(|p| p.releases() == 1));
        assert_eq!(scope.live_count(), 0);
    }

    #[test]
    fn test_detach_skips_release() {
        let scope = test_scope();
        let kept = Tracked::new(false);
        let dropped = Tracked::new(false);
        scope.attach(kept.clone()).unwrap();
        scope.attach(dropped.clone()).unwrap();

        let removed = scope.detach(kept.id()).unwrap();
        assert_eq!(removed.map(|r| r.id()), Some(kept.id()));
        assert!(scope.detach(kept.id()).unwrap().is_none());

        scope.close();
        assert_eq!(kept.releases(), 0);
        assert_eq!(dropped.releases(), 1);
    }

    #[test]
    fn test_attach_detach_after_close_fail() {
        let scope = test_scope();
        scope.close();
        for _ in 0..3 {
            let tracked = Tracked::new(false);
            assert!(scope.attach(tracked.clone()).unwrap_err().is_illegal_state());
            assert!(scope.detach(tracked.id()).unwrap_err().is_illegal_state());
        }
        assert!(scope.new_sub_scope(None).unwrap_err().is_illegal_state());
    }

    #[test]
    fn test_root_operations_are_noops() {
        let root = ResourceScope::root();
        let tracked = Tracked::new(false);
        root.attach(tracked.clone()).unwrap();
        assert!(!root.contains(tracked.id()));
        assert!(root.detach(tracked.id()).unwrap().is_none());
        assert!(root.close_with_report().is_none());
        root.close();
        assert!(root.is_open());
        assert!(root.is_root());
        assert!(root.parent().is_none());
        assert_eq!(tracked.releases(), 0);
    }

    #[test]
    fn test_install_root_after_init_fails() {
        let _ = ResourceScope::root();
        let err = ResourceScope::install_root(&EngineConfig::default()).unwrap_err();
        assert!(err.is_illegal_state());
    }

    #[test]
    fn test_nested_close_cascades() {
        let parent = test_scope();
        let child = parent.new_sub_scope(None).unwrap();
        let grandchild = child.new_sub_scope(Some(Device::gpu(1))).unwrap();
        let tracked = Tracked::new(false);
        grandchild.attach(tracked.clone()).unwrap();

        assert!(parent.contains(child.id()));
        assert_eq!(grandchild.device(), Device::gpu(1));
        assert_eq!(child.device(), parent.device());

        parent.close();
        assert!(!child.is_open());
        assert!(!grandchild.is_open());
        assert_eq!(tracked.releases(), 1);
    }

    #[test]
    fn test_child_close_leaves_parent() {
        let parent = test_scope();
        let child = parent.new_sub_scope(None).unwrap();
        assert_eq!(parent.live_count(), 1);
        child.close();
        assert_eq!(parent.live_count(), 0);
        assert!(parent.is_open());
        assert_eq!(child.parent().map(|p| p.id()), Some(parent.id()));
    }

    #[test]
    fn test_observer_receives_failures_and_is_inherited() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let parent = ResourceScope::root()
            .new_sub_scope_with(
                SubScopeOptions::new()
                    .dispatcher(Arc::new(HostEngine::new()))
                    .observer(move |report| sink.lock().push(report.clone())),
            )
            .unwrap();
        let child = parent.new_sub_scope(None).unwrap();
        child.attach(Tracked::new(true)).unwrap();

        parent.close();
        let reports = seen.lock();
        assert_eq!(reports.len(), 2, "child and parent each report once");
        let child_report = reports.iter().find(|r| r.scope == child.id()).unwrap();
        assert_eq!(child_report.failures.len(), 1);
        let parent_report = reports.iter().find(|r| r.scope == parent.id()).unwrap();
        assert!(parent_report.is_clean());
    }

    #[test]
    fn test_scope_cannot_attach_itself() {
        let scope = test_scope();
        let err = scope.attach(scope.clone()).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_dropping_scope_releases_arrays() {
        let engine = Arc::new(HostEngine::new());
        let scope = ResourceScope::root()
            .new_sub_scope_with(SubScopeOptions::new().dispatcher(engine.clone()))
            .unwrap();
        scope.create(None, &Shape::from([4]), DataType::Float32).unwrap();
        assert_eq!(engine.live_count(), 1);
        drop(scope);
        assert_eq!(engine.live_count(), 0);
    }

    #[test]
    fn test_sub_scope_picks_registered_engine() {
        let engine = Arc::new(HostEngine::new());
        let name = format!("host-{}", ResourceId::next());
        ResourceScope::root().engines().register(name.clone(), engine.clone());

        let parent = test_scope();
        let scope = parent.new_sub_scope_with(SubScopeOptions::new().engine(&name)).unwrap();
        scope.zeros(None, &Shape::from([2]), DataType::Float32).unwrap();
        assert_eq!(engine.live_count(), 1);
        // Nested scopes inherit the routed engine.
        let nested = scope.new_sub_scope(None).unwrap();
        nested.ones(None, &Shape::from([2]), DataType::Float32).unwrap();
        assert_eq!(engine.live_count(), 2);

        parent.close();
        assert_eq!(engine.live_count(), 0);
        ResourceScope::root().engines().remove(&name);
    }

    #[test]
    fn test_unknown_engine_name_is_rejected() {
        let parent = test_scope();
        let err = parent
            .new_sub_scope_with(SubScopeOptions::new().engine("no-such-engine"))
            .unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(parent.live_count(), 0);
    }

    #[test]
    fn test_root_engine_is_registered() {
        let root = ResourceScope::root();
        let name = root.dispatcher().name().to_string();
        assert!(root.engines().list().contains(&name));
    }

    #[test]
    fn test_concurrent_attach_no_lost_updates() {
        let scope = test_scope();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let scope = scope.clone();
                std::thread::spawn(move || {
                    for _ in 0..64 {
                        scope.attach(Tracked::new(false)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread panicked");
        }
        assert_eq!(scope.live_count(), 8 * 64);
    }
}
