//! The Runnable engine: scheduled units of work and their dependencies
//!
//! A [`Runnable`] is the abstract unit the scheduler drives: it has a
//! repeat interval, an optional timeout, a set of dependencies forming a
//! DAG, and a result slot holding the outcome of its last run. Groups,
//! tests and queries are all Runnables; they differ only in their body.
//!
//! The central guarantee is single-flight execution: a Runnable has at
//! most one run in flight, and every `start()` call made while that run
//! is active receives the same completion handle. Dependents therefore
//! share one underlying request per tick regardless of how many of them
//! fan in.

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use shared::status::Outcome;
use shared::utils::{current_timestamp_millis, truncate_string};
use shared::ProbeError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::queries::Query;
use crate::test::TestSpec;

/// Completion handle returned by [`Runnable::start`]. Cloneable; all
/// clones resolve with the same [`Outcome`].
pub type StartHandle = Shared<BoxFuture<'static, Outcome>>;

/// Locks a mutex, ignoring poisoning. The guarded state stays consistent
/// because every critical section is a plain field update.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle of a Runnable between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    WaitingForDeps,
    Running,
    Done,
}

/// What a Runnable does when its dependencies have settled.
pub enum RunnableKind {
    /// No body of its own; useful as a bare dependency node.
    Plain,
    /// Synthetic tick root driving a cohort of dependents.
    Group,
    /// Composes filters over its query's result and emits a status.
    Test(TestSpec),
    /// Performs one outbound request against a remote system.
    Query(Query),
}

/// A scheduled unit of work.
pub struct Runnable {
    /// Display name used in logs and error messages.
    name: String,
    kind: RunnableKind,
    /// Scheduling interval; zero means single-shot.
    repeat: Duration,
    /// Bound on the running phase. Queries fall back to their default.
    timeout: Option<Duration>,
    /// Forward dependency edges, in insertion order. Reverse edges are
    /// derived by traversal when needed; they are never owned.
    deps: Mutex<Vec<Arc<Runnable>>>,
    /// Set on the first `start()`; dependency edges freeze at that point.
    started: AtomicBool,
    state: Mutex<RunState>,
    /// Outcome of the most recent completed run.
    result: Mutex<Option<Outcome>>,
    /// Payload accumulated by the current body, preserved on timeout.
    partial: Mutex<String>,
    last_run_ms: AtomicU64,
    last_finish_ms: AtomicU64,
    /// The in-flight completion handle, shared by concurrent starters.
    inflight: Mutex<Option<StartHandle>>,
}

impl Runnable {
    /// Creates a new Runnable. The returned `Arc` is the only handle type
    /// the engine works with; dependency edges and start handles both
    /// need shared ownership.
    pub fn new(
        name: impl Into<String>,
        kind: RunnableKind,
        repeat: Duration,
        timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind,
            repeat,
            timeout,
            deps: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            state: Mutex::new(RunState::Idle),
            result: Mutex::new(None),
            partial: Mutex::new(String::new()),
            last_run_ms: AtomicU64::new(0),
            last_finish_ms: AtomicU64::new(0),
            inflight: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &RunnableKind {
        &self.kind
    }

    /// Task-census label for this Runnable.
    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            RunnableKind::Plain => "runnable",
            RunnableKind::Group => "group",
            RunnableKind::Test(_) => "test",
            RunnableKind::Query(_) => "query",
        }
    }

    pub fn repeat(&self) -> Duration {
        self.repeat
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn state(&self) -> RunState {
        *lock(&self.state)
    }

    /// Outcome of the last completed run, if any.
    pub fn result(&self) -> Option<Outcome> {
        lock(&self.result).clone()
    }

    /// Unix milliseconds of the last body start, if any run happened.
    pub fn last_run_millis(&self) -> Option<u64> {
        match self.last_run_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Unix milliseconds of the last completion, if any run finished.
    pub fn last_finish_millis(&self) -> Option<u64> {
        match self.last_finish_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Snapshot of the forward dependency edges.
    pub fn dependencies(&self) -> Vec<Arc<Runnable>> {
        lock(&self.deps).clone()
    }

    /// Whether `target` is reachable through this Runnable's dependencies.
    pub fn depends_on(&self, target: &Arc<Runnable>) -> bool {
        let deps = self.dependencies();
        deps.iter()
            .any(|dep| Arc::ptr_eq(dep, target) || dep.depends_on(target))
    }

    /// Records a dependency edge and rejects cycles. Only permitted
    /// before the Runnable has ever started.
    pub fn add_dependency(self: &Arc<Self>, dep: &Arc<Runnable>) -> shared::Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(ProbeError::Config(format!(
                "cannot add dependencies to '{}' after it has started",
                self.name
            ))
            .into());
        }

        if Arc::ptr_eq(self, dep) || dep.depends_on(self) {
            return Err(ProbeError::Config(format!(
                "dependency cycle between '{}' and '{}'",
                self.name, dep.name
            ))
            .into());
        }

        lock(&self.deps).push(Arc::clone(dep));
        Ok(())
    }

    /// Starts one tick, or joins the tick already in flight.
    ///
    /// The returned handle resolves when the run completes. Calling
    /// `start()` again while the run is active returns a handle to the
    /// same run; a new run is not scheduled. Sharded-out tests resolve
    /// immediately with a vacuous success without touching any state.
    pub fn start(self: &Arc<Self>) -> StartHandle {
        if let RunnableKind::Test(spec) = &self.kind {
            if !spec.should_run() {
                debug!("Skipping start of '{}' on this peer", self.name);
                return future::ready(Ok(String::new())).boxed().shared();
            }
        }

        self.started.store(true, Ordering::SeqCst);

        let mut inflight = lock(&self.inflight);
        if let Some(handle) = inflight.as_ref() {
            debug!("'{}' already running, joining in-flight run", self.name);
            return handle.clone();
        }

        let this = Arc::clone(self);
        let handle = async move { this.run().await }.boxed().shared();
        *inflight = Some(handle.clone());
        handle
    }

    /// One tick: settle dependencies, run the body, publish the result.
    async fn run(self: Arc<Self>) -> Outcome {
        *lock(&self.state) = RunState::WaitingForDeps;

        let deps = self.dependencies();
        if !deps.is_empty() {
            debug!("'{}' waiting for {} dependencies", self.name, deps.len());
            let pending: Vec<StartHandle> = deps.iter().map(|dep| dep.start()).collect();
            // A failed dependency does not abort this run; the body
            // observes the failure through the dependency's result slot.
            future::join_all(pending).await;
        }

        *lock(&self.state) = RunState::Running;
        self.last_run_ms
            .store(current_timestamp_millis(), Ordering::Relaxed);
        lock(&self.partial).clear();

        let outcome = match &self.kind {
            RunnableKind::Plain | RunnableKind::Group => Ok(String::new()),
            RunnableKind::Test(spec) => spec.compose(&deps),
            RunnableKind::Query(query) => {
                let timeout = self
                    .timeout
                    .unwrap_or(crate::queries::DEFAULT_QUERY_TIMEOUT);
                query.execute(timeout, &self.partial, &deps).await
            }
        };

        match &outcome {
            Ok(payload) => debug!(
                "'{}' finished: {}",
                self.name,
                truncate_string(payload, 120)
            ),
            Err(failure) => debug!("'{}' failed: {}", self.name, failure),
        }

        *lock(&self.result) = Some(outcome.clone());
        self.last_finish_ms
            .store(current_timestamp_millis(), Ordering::Relaxed);
        *lock(&self.state) = RunState::Done;

        // Clear the in-flight slot before waiters observe completion so
        // the next start() begins a fresh tick.
        lock(&self.inflight).take();
        *lock(&self.state) = RunState::Idle;

        outcome
    }
}

impl std::fmt::Debug for Runnable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runnable")
            .field("name", &self.name)
            .field("kind", &self.kind_label())
            .field("repeat", &self.repeat)
            .field("state", &self.state())
            .finish()
    }
}
