//! Group-rooted scheduling of the Runnable population
//!
//! The scheduler owns the registered top-level Runnables. `prepare()`
//! walks their dependency closure, gathers roots whose closures touch
//! into cohorts, and plants a synthetic Group Runnable in front of each
//! cohort: one tick of the Group drives every member, and the dependency
//! traversal guarantees shared sub-queries execute exactly once per
//! tick. Group ticks are staggered across their period so the
//! population does not fire as one thundering herd.
//!
//! Each Group gets a dedicated ticker task that reports due ticks over a
//! channel; the scheduler loop measures tick latency, skips ticks whose
//! previous run is still in flight (recording the skip), and hands
//! completed runs back through a second channel.

use serde::Serialize;
use shared::config::EngineConfig;
use shared::ProbeError;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::runnable::{lock, Runnable, RunnableKind};
use crate::test::{PeerHandle, PeerInfo};

/// A due tick reported by a Group's ticker task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TickEvent {
    /// Index of the Group in the scheduler's table.
    pub index: usize,
    /// Actual start minus scheduled time of this tick.
    pub latency: Duration,
}

/// Counts of scheduled task kinds, including the synthetic Groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCensus {
    pub count: usize,
    pub tests: usize,
    pub queries: usize,
    pub groups: usize,
    pub runnables: usize,
}

/// Latency summary over the most recent accounting window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub period_seconds: u64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub samples: usize,
}

/// Snapshot returned by [`Scheduler::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub tasks: TaskCensus,
    pub latency: LatencySummary,
    pub skipped_ticks: u64,
}

/// Ring of latency samples covering one accounting window.
pub struct LatencyTracker {
    period: Duration,
    samples: VecDeque<(Instant, f64)>,
}

impl LatencyTracker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            samples: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > self.period {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record(&mut self, latency: Duration) {
        let now = Instant::now();
        self.prune(now);
        self.samples.push_back((now, latency.as_secs_f64()));
    }

    pub fn summary(&mut self) -> LatencySummary {
        self.prune(Instant::now());

        let mut min = f64::MAX;
        let mut max: f64 = 0.0;
        let mut sum = 0.0;
        for (_, sample) in &self.samples {
            min = min.min(*sample);
            max = max.max(*sample);
            sum += *sample;
        }

        let samples = self.samples.len();
        LatencySummary {
            period_seconds: self.period.as_secs(),
            min: if samples == 0 { 0.0 } else { min },
            max,
            avg: if samples == 0 {
                0.0
            } else {
                sum / samples as f64
            },
            samples,
        }
    }
}

/// Scheduler statistics shared with read-only observers such as the
/// monitoring endpoint.
pub struct StatsHandle {
    census: Mutex<TaskCensus>,
    latency: Mutex<LatencyTracker>,
    skipped_ticks: AtomicU64,
}

impl StatsHandle {
    pub fn new(period: Duration) -> Self {
        Self {
            census: Mutex::new(TaskCensus::default()),
            latency: Mutex::new(LatencyTracker::new(period)),
            skipped_ticks: AtomicU64::new(0),
        }
    }

    fn set_census(&self, census: TaskCensus) {
        *lock(&self.census) = census;
    }

    pub fn record_latency(&self, latency: Duration) {
        lock(&self.latency).record(latency);
    }

    pub fn record_skip(&self) {
        self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            tasks: *lock(&self.census),
            latency: lock(&self.latency).summary(),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
        }
    }
}

/// Lifecycle of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

struct GroupHandle {
    runnable: Arc<Runnable>,
    period: Duration,
    offset: Duration,
    in_flight: bool,
    ticker: Option<tokio::task::JoinHandle<()>>,
}

/// Drives the registered Runnable population.
pub struct Scheduler {
    /// Registered top-level Runnables, in registration order.
    runnables: Vec<Arc<Runnable>>,
    /// Synthetic Groups created by `prepare()`.
    groups: Vec<GroupHandle>,
    /// Registered roots with no repeat; started exactly once.
    single_shot: Vec<Arc<Runnable>>,
    stats: Arc<StatsHandle>,
    peers: Arc<PeerHandle>,
    ready_tx: mpsc::Sender<TickEvent>,
    ready_rx: mpsc::Receiver<TickEvent>,
    done_tx: mpsc::Sender<usize>,
    done_rx: mpsc::Receiver<usize>,
    pub state: SchedulerState,
    prepared: bool,
    graceful_shutdown_timeout: Duration,
}

impl Scheduler {
    pub fn new(config: &EngineConfig) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(config.channel_buffer_size);
        let (done_tx, done_rx) = mpsc::channel(config.channel_buffer_size);

        Self {
            runnables: Vec::new(),
            groups: Vec::new(),
            single_shot: Vec::new(),
            stats: Arc::new(StatsHandle::new(Duration::from_secs(
                config.latency_period_seconds,
            ))),
            peers: Arc::new(PeerHandle::new(PeerInfo {
                peer_id: config.peer_id,
                num_peers: config.num_peers,
            })),
            ready_tx,
            ready_rx,
            done_tx,
            done_rx,
            state: SchedulerState::Stopped,
            prepared: false,
            graceful_shutdown_timeout: Duration::from_secs(
                config.graceful_shutdown_timeout_seconds,
            ),
        }
    }

    /// The cluster position consulted by sharded tests.
    pub fn peers(&self) -> Arc<PeerHandle> {
        Arc::clone(&self.peers)
    }

    /// Statistics handle for read-only observers.
    pub fn stats_handle(&self) -> Arc<StatsHandle> {
        Arc::clone(&self.stats)
    }

    /// Snapshot of task counts and latency.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.snapshot()
    }

    /// Number of Groups formed by `prepare()`.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Stagger offsets assigned at prepare time, in group order.
    pub(crate) fn group_offsets(&self) -> Vec<Duration> {
        self.groups.iter().map(|group| group.offset).collect()
    }

    /// Adds a top-level Runnable. Only permitted before `prepare()`.
    pub fn register(&mut self, runnable: Arc<Runnable>) -> shared::Result<()> {
        if self.prepared {
            return Err(ProbeError::Config(
                "runnables cannot be registered after prepare()".into(),
            )
            .into());
        }
        debug!("Registering '{}'", runnable.name());
        self.runnables.push(runnable);
        Ok(())
    }

    /// Computes the dependency closure, forms Groups over connected
    /// cohorts of registered roots, assigns stagger offsets, and
    /// initializes the task census. Called once after all registrations.
    pub fn prepare(&mut self) -> shared::Result<()> {
        if self.prepared {
            return Err(ProbeError::Config("scheduler already prepared".into()).into());
        }
        self.prepared = true;

        // Transitive closure from the registered roots.
        let mut closure: Vec<Arc<Runnable>> = Vec::new();
        let mut index_of: HashMap<*const Runnable, usize> = HashMap::new();

        fn collect(
            node: &Arc<Runnable>,
            closure: &mut Vec<Arc<Runnable>>,
            index_of: &mut HashMap<*const Runnable, usize>,
        ) {
            if index_of.contains_key(&Arc::as_ptr(node)) {
                return;
            }
            index_of.insert(Arc::as_ptr(node), closure.len());
            closure.push(Arc::clone(node));
            for dep in node.dependencies() {
                collect(&dep, closure, index_of);
            }
        }

        for root in &self.runnables {
            collect(root, &mut closure, &mut index_of);
        }

        // Union the closure along its dependency edges: roots that share
        // any sub-query end up in the same cohort.
        let mut parent: Vec<usize> = (0..closure.len()).collect();
        for node in &closure {
            let a = index_of[&Arc::as_ptr(node)];
            for dep in node.dependencies() {
                let b = index_of[&Arc::as_ptr(&dep)];
                union(&mut parent, a, b);
            }
        }

        // Gather repeating roots per cohort, preserving registration order.
        let mut cohorts: Vec<Vec<Arc<Runnable>>> = Vec::new();
        let mut cohort_index: HashMap<usize, usize> = HashMap::new();
        for root in &self.runnables {
            if root.repeat().is_zero() {
                self.single_shot.push(Arc::clone(root));
                continue;
            }
            let representative = find(&mut parent, index_of[&Arc::as_ptr(root)]);
            let slot = match cohort_index.get(&representative) {
                Some(slot) => *slot,
                None => {
                    cohorts.push(Vec::new());
                    cohort_index.insert(representative, cohorts.len() - 1);
                    cohorts.len() - 1
                }
            };
            cohorts[slot].push(Arc::clone(root));
        }

        // One Group per cohort, staggered evenly across its period.
        let total = cohorts.len();
        for (i, roots) in cohorts.into_iter().enumerate() {
            let period = roots
                .iter()
                .map(|root| root.repeat())
                .min()
                .unwrap_or(Duration::ZERO);
            let offset = period.mul_f64(i as f64 / total as f64);

            let group = Runnable::new(
                format!("group-{}-{}s", i + 1, period.as_secs()),
                RunnableKind::Group,
                period,
                None,
            );
            for root in &roots {
                group.add_dependency(root)?;
            }

            info!(
                "Group '{}': {} members, period {:?}, offset {:?}",
                group.name(),
                roots.len(),
                period,
                offset
            );

            self.groups.push(GroupHandle {
                runnable: group,
                period,
                offset,
                in_flight: false,
                ticker: None,
            });
        }

        // Task census over the user population plus the synthetic Groups.
        let mut census = TaskCensus::default();
        for node in &closure {
            match node.kind() {
                RunnableKind::Test(_) => census.tests += 1,
                RunnableKind::Query(_) => census.queries += 1,
                RunnableKind::Group => census.groups += 1,
                RunnableKind::Plain => census.runnables += 1,
            }
        }
        census.groups += self.groups.len();
        census.count = closure.len() + self.groups.len();
        self.stats.set_census(census);

        info!(
            "Prepared scheduler: {} runnables in closure, {} groups, {} single-shot",
            closure.len(),
            self.groups.len(),
            self.single_shot.len()
        );

        Ok(())
    }

    /// Spawns the per-Group ticker tasks and fires single-shot roots.
    pub fn start(&mut self) -> shared::Result<()> {
        if !self.prepared {
            return Err(ProbeError::Config("prepare() must run before start()".into()).into());
        }

        info!("Starting scheduler with {} groups", self.groups.len());

        for (index, group) in self.groups.iter_mut().enumerate() {
            let ready_tx = self.ready_tx.clone();
            let period = group.period;
            let offset = group.offset;
            let name = group.runnable.name().to_string();

            let ticker = tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(Instant::now() + offset, period);
                loop {
                    let scheduled = interval.tick().await;
                    let latency = scheduled.elapsed();
                    if ready_tx.send(TickEvent { index, latency }).await.is_err() {
                        debug!("Ticker for '{}' stopping as channel is closed.", name);
                        break;
                    }
                }
            });
            group.ticker = Some(ticker);
        }

        for runnable in &self.single_shot {
            debug!("Starting single-shot runnable '{}'", runnable.name());
            let handle = runnable.start();
            tokio::spawn(async move {
                let _ = handle.await;
            });
        }

        self.state = SchedulerState::Running;
        Ok(())
    }

    /// The scheduler loop: dispatch due ticks, collect completions,
    /// exit on shutdown.
    pub async fn run(&mut self, shutdown: &mut broadcast::Receiver<()>) -> shared::Result<()> {
        info!("Scheduler loop running");

        while self.state == SchedulerState::Running {
            tokio::select! {
                Some(event) = self.ready_rx.recv() => self.handle_tick(event),
                Some(index) = self.done_rx.recv() => self.finish_tick(index),
                _ = shutdown.recv() => {
                    info!("Scheduler loop received shutdown signal");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Dispatches one due tick, skipping it when the Group's previous
    /// tick is still in flight.
    pub(crate) fn handle_tick(&mut self, event: TickEvent) {
        self.stats.record_latency(event.latency);

        let Some(group) = self.groups.get_mut(event.index) else {
            return;
        };

        if group.in_flight {
            // Backpressure: the new tick is skipped, not queued.
            self.stats.record_skip();
            warn!(
                "Skipping tick of '{}' as the previous tick is still running.",
                group.runnable.name()
            );
            return;
        }

        debug!(
            "Tick of '{}' (latency {:?})",
            group.runnable.name(),
            event.latency
        );
        group.in_flight = true;

        let handle = group.runnable.start();
        let done_tx = self.done_tx.clone();
        let index = event.index;
        tokio::spawn(async move {
            let _ = handle.await;
            let _ = done_tx.send(index).await;
        });
    }

    pub(crate) fn finish_tick(&mut self, index: usize) {
        if let Some(group) = self.groups.get_mut(index) {
            group.in_flight = false;
        }
    }

    /// Whether the indexed Group has a tick in flight.
    pub(crate) fn is_in_flight(&self, index: usize) -> bool {
        self.groups.get(index).is_some_and(|group| group.in_flight)
    }

    /// Stops the scheduler: waits for in-flight group runs up to the
    /// configured timeout, then aborts the ticker tasks.
    pub async fn stop(&mut self) -> shared::Result<()> {
        info!("Stopping scheduler gracefully");
        self.state = SchedulerState::Stopped;

        let in_flight = self.groups.iter().filter(|group| group.in_flight).count();
        if in_flight > 0 {
            info!(
                "Waiting for {} in-flight group runs (timeout: {:?})",
                in_flight, self.graceful_shutdown_timeout
            );

            let deadline = Instant::now() + self.graceful_shutdown_timeout;
            let mut check_interval = tokio::time::interval(Duration::from_millis(100));

            loop {
                check_interval.tick().await;

                while let Ok(index) = self.done_rx.try_recv() {
                    self.finish_tick(index);
                }

                let still_running = self.groups.iter().filter(|group| group.in_flight).count();
                if still_running == 0 {
                    info!("All in-flight group runs completed");
                    break;
                }

                if Instant::now() >= deadline {
                    warn!(
                        "Graceful shutdown timeout reached, {} group runs still in flight",
                        still_running
                    );
                    break;
                }
            }
        }

        for group in &mut self.groups {
            if let Some(ticker) = group.ticker.take() {
                ticker.abort();
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Whether the scheduler is currently in the `Running` state.
    pub fn is_running(&self) -> bool {
        self.state == SchedulerState::Running
    }
}

fn find(parent: &mut [usize], mut node: usize) -> usize {
    while parent[node] != node {
        parent[node] = parent[parent[node]];
        node = parent[node];
    }
    node
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let root_a = find(parent, a);
    let root_b = find(parent, b);
    if root_a != root_b {
        parent[root_b] = root_a;
    }
}
