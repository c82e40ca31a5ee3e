//! Process-wide cancellation coordination.
//!
//! A [`CancellationCoordinator`] is created once per process by the host and
//! handed to every component that opens a cancellation scope. It collects
//! cancel functions and [`RunnerHandle`]s from concurrently running builds
//! and turns an external termination request into targeted cancellation.
//!
//! Two modes are supported:
//!
//! - [`CancelMode::Terminate`]: one scope per build; the host exits the
//!   process after [`CancellationCoordinator::trigger`].
//! - [`CancelMode::Interactive`]: one scope per statement; triggering cancels
//!   only the statement in flight and the process keeps running. Runners stay
//!   registered, since the session keeps using the engine afterwards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{BoxError, Result};

type CancelFn = Box<dyn FnOnce() + Send + 'static>;

/// How the host reacts to a triggered cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// Cancel everything, then terminate the process.
    Terminate,
    /// Cancel the current statement only and return to the prompt.
    Interactive,
}

/// A cancellation scope threaded into every engine call.
///
/// Cloning yields another handle to the same scope.
#[derive(Clone)]
pub struct CancelScope {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelScope {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancel the scope. Repeated calls are no-ops.
    pub fn cancel(&self) {
        self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the scope has been cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Fail fast with `Cancelled` if the scope is already cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BoxError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run a future to completion unless the scope is cancelled first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(BoxError::Cancelled),
            out = fut => out,
        }
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelScope")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct RunnerInner {
    id: Uuid,
    label: String,
    closes: AtomicUsize,
    done: watch::Sender<bool>,
}

/// Liveness handle for one in-flight, externally cancellable operation.
///
/// Created together with a [`RunnerGuard`] that the operation holds; the
/// runner counts as finished once the guard is dropped.
#[derive(Clone)]
pub struct RunnerHandle {
    inner: Arc<RunnerInner>,
}

/// Held by the running operation. Dropping it marks the runner finished.
pub struct RunnerGuard {
    inner: Arc<RunnerInner>,
}

impl RunnerHandle {
    pub fn new(label: impl Into<String>) -> (RunnerHandle, RunnerGuard) {
        let (done, _rx) = watch::channel(false);
        let inner = Arc::new(RunnerInner {
            id: Uuid::new_v4(),
            label: label.into(),
            closes: AtomicUsize::new(0),
            done,
        });
        (
            RunnerHandle {
                inner: inner.clone(),
            },
            RunnerGuard { inner },
        )
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Release the handle on behalf of the coordinator.
    pub fn close(&self) {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.times_closed() > 0
    }

    /// How many times the handle was released.
    pub fn times_closed(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Resolves once the operation has dropped its guard.
    pub async fn finished(&self) {
        let mut rx = self.inner.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl std::fmt::Debug for RunnerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerHandle")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("closed", &self.is_closed())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Drop for RunnerGuard {
    fn drop(&mut self) {
        self.inner.done.send_replace(true);
    }
}

/// Ticket for a registered cancel function, used to withdraw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Registration(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    cancel_fns: Vec<(Registration, CancelFn)>,
    runners: Vec<RunnerHandle>,
}

/// Registry of active cancellation scopes and in-flight runner handles.
///
/// Registrations arrive from many concurrent build tasks, so both lists are
/// guarded by one mutex. Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct CancellationCoordinator {
    mode: CancelMode,
    registry: Arc<Mutex<Registry>>,
}

impl CancellationCoordinator {
    pub fn new(mode: CancelMode) -> Self {
        Self {
            mode,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn mode(&self) -> CancelMode {
        self.mode
    }

    /// Register a cancel function, called at most once by [`trigger`](Self::trigger).
    pub fn register(&self, cancel: impl FnOnce() + Send + 'static) -> Registration {
        let mut registry = self.registry.lock();
        let registration = Registration(registry.next_id);
        registry.next_id += 1;
        registry.cancel_fns.push((registration, Box::new(cancel)));
        registration
    }

    /// Register a scope so that triggering cancels it.
    pub fn register_scope(&self, scope: &CancelScope) -> Registration {
        let scope = scope.clone();
        self.register(move || scope.cancel())
    }

    /// Withdraw a cancel function without calling it.
    ///
    /// Unknown or already triggered registrations are ignored.
    pub fn deregister(&self, registration: Registration) {
        self.registry
            .lock()
            .cancel_fns
            .retain(|(r, _)| *r != registration);
    }

    /// Open a fresh scope that is already registered.
    pub fn new_scope(&self) -> CancelScope {
        let scope = CancelScope::new();
        self.register_scope(&scope);
        scope
    }

    pub fn register_runner(&self, handle: RunnerHandle) {
        tracing::trace!(runner = %handle.label(), "Registered runner");
        self.registry.lock().runners.push(handle);
    }

    /// Drop a finished runner so a later trigger doesn't touch it.
    pub fn deregister_runner(&self, handle: &RunnerHandle) {
        self.registry
            .lock()
            .runners
            .retain(|r| r.id() != handle.id());
    }

    /// Cancel every registered scope, and in terminate mode release every
    /// registered runner.
    ///
    /// Each cancel function and runner is handled exactly once; the handled
    /// entries are removed, so repeated signals are harmless. The released
    /// runners are returned so a terminating host can wait for them. In
    /// interactive mode runners are left alone and nothing is returned.
    pub fn trigger(&self) -> Vec<RunnerHandle> {
        let (cancel_fns, runners) = {
            let mut registry = self.registry.lock();
            let cancel_fns = std::mem::take(&mut registry.cancel_fns);
            let runners = match self.mode {
                CancelMode::Terminate => std::mem::take(&mut registry.runners),
                CancelMode::Interactive => Vec::new(),
            };
            (cancel_fns, runners)
        };

        tracing::debug!(
            mode = ?self.mode,
            scopes = cancel_fns.len(),
            runners = runners.len(),
            "Cancellation triggered"
        );

        for (_, cancel) in cancel_fns {
            cancel();
        }
        for runner in &runners {
            runner.close();
        }
        runners
    }

    pub fn pending_cancels(&self) -> usize {
        self.registry.lock().cancel_fns.len()
    }

    pub fn runner_count(&self) -> usize {
        self.registry.lock().runners.len()
    }
}

impl std::fmt::Debug for CancellationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("CancellationCoordinator")
            .field("mode", &self.mode)
            .field("cancel_fns", &registry.cancel_fns.len())
            .field("runners", &registry.runners.len())
            .finish()
    }
}
