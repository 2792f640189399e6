use crate::run::IndexingRun;
use crate::status::StatusStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use watchdex_locks::{
    LeaseCoordinator, LeaseGuard, LockError, LockManager, SERVER_SCHEDULER_LEASE,
};
use watchdex_registry::{
    unix_now_ms, Requester, RootFilter, RootId, RootRegistry, WatchedRoot,
};
use watchdex_scanner::ScanExecutor;

/// Backoff multiplier cap: effective interval is `schedule × 2^streak`,
/// with the shift clamped so a long-broken root retries at ×64 at most.
const BACKOFF_SHIFT_CAP: u32 = 6;

/// When the root's next attempt is due, growing with its failure streak.
/// A root that has never been scanned is due immediately.
#[must_use]
pub fn next_due_ms(root: &WatchedRoot) -> u64 {
    let Some(anchor) = root.last_scan_completed_at.or(root.last_scan_started_at) else {
        return 0;
    };
    let shift = root.consecutive_failures.min(BACKOFF_SHIFT_CAP);
    let interval_ms = root
        .schedule_secs
        .saturating_mul(1000)
        .saturating_mul(1u64 << shift);
    anchor.saturating_add(interval_ms)
}

#[must_use]
pub fn is_due(root: &WatchedRoot, now_ms: u64) -> bool {
    now_ms >= next_due_ms(root)
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Failure streak at which a root's health escalates from `Degraded` to
    /// `Error`.
    pub failure_threshold: u32,
    /// Lock TTL override; `None` uses the lock manager's default.
    pub lock_ttl: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            failure_threshold: 5,
            lock_ttl: None,
        }
    }
}

/// Why a launch attempt produced no scan.
enum LaunchSkip {
    /// Another scan holds every slot; worth retrying next tick.
    Contended,
    /// Authorization or bookkeeping refused the run; not retried.
    Rejected,
}

struct ServerLease {
    coordinator: LeaseCoordinator,
    guard: Mutex<Option<LeaseGuard>>,
}

struct SchedulerInner {
    registry: Arc<RootRegistry>,
    locks: Arc<LockManager>,
    executor: Arc<ScanExecutor>,
    status: Arc<StatusStore>,
    requester: Requester,
    holder_id: String,
    config: SchedulerConfig,
    in_flight: Mutex<HashMap<RootId, u32>>,
    /// Out-of-schedule requests: root → dry_run flag.
    forced: Mutex<HashMap<RootId, bool>>,
    /// Present only for the server variant.
    lease: Option<ServerLease>,
}

/// Periodically selects eligible roots for this executor's scope and
/// dispatches scans, one spawned task per run. The scheduling path never
/// awaits a scan: it acquires the lock, launches the task and moves on, so an
/// in-flight scan on one root cannot delay scan timing or status visibility
/// for any other.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Client variant: acts only on roots owned by `executor_id`.
    #[must_use]
    pub fn client(
        registry: Arc<RootRegistry>,
        locks: Arc<LockManager>,
        executor: Arc<ScanExecutor>,
        status: Arc<StatusStore>,
        config: SchedulerConfig,
        executor_id: impl Into<String>,
    ) -> Self {
        let executor_id = executor_id.into();
        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                locks,
                executor,
                status,
                requester: Requester::client(executor_id.clone()),
                holder_id: executor_id,
                config,
                in_flight: Mutex::new(HashMap::new()),
                forced: Mutex::new(HashMap::new()),
                lease: None,
            }),
        }
    }

    /// Server variant: acts on server-scope roots, and only while holding the
    /// singleton lease.
    #[must_use]
    pub fn server(
        registry: Arc<RootRegistry>,
        locks: Arc<LockManager>,
        executor: Arc<ScanExecutor>,
        status: Arc<StatusStore>,
        config: SchedulerConfig,
        lease_coordinator: LeaseCoordinator,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                locks,
                executor,
                status,
                requester: Requester::server(),
                holder_id: "server".to_string(),
                config,
                in_flight: Mutex::new(HashMap::new()),
                forced: Mutex::new(HashMap::new()),
                lease: Some(ServerLease {
                    coordinator: lease_coordinator,
                    guard: Mutex::new(None),
                }),
            }),
        }
    }

    #[must_use]
    pub fn status(&self) -> Arc<StatusStore> {
        self.inner.status.clone()
    }

    /// One scheduling pass. Returns the handles of the scans it launched;
    /// the background loop drops them (scans are fire-and-forget there), while
    /// tests await them for determinism.
    pub async fn tick(&self) -> Vec<JoinHandle<()>> {
        if !self.ensure_lease() {
            return Vec::new();
        }

        // Re-read current registry state every tick; acting on a cached view
        // could mean acting on stale ownership.
        let filter = RootFilter::for_requester(&self.inner.requester);
        let roots = self.inner.registry.list(&filter).await;
        let now = unix_now_ms();

        let mut handles = Vec::new();
        for root in roots {
            let forced = {
                let mut forced = self.inner.forced.lock().expect("forced set poisoned");
                forced.remove(&root.root_id)
            };

            if forced.is_none() && (root.paused || !is_due(&root, now)) {
                continue;
            }
            if self.running_count(&root.root_id) >= root.max_concurrency {
                if let Some(dry_run) = forced {
                    // Keep the request queued until capacity frees up.
                    self.inner
                        .forced
                        .lock()
                        .expect("forced set poisoned")
                        .insert(root.root_id.clone(), dry_run);
                }
                continue;
            }

            let root_id = root.root_id.clone();
            match self.launch(root, forced.unwrap_or(false)).await {
                Ok(handle) => handles.push(handle),
                Err(LaunchSkip::Contended) => {
                    if let Some(dry_run) = forced {
                        // A forced request outlives lock contention; it stays
                        // queued for the next tick instead of vanishing.
                        self.inner
                            .forced
                            .lock()
                            .expect("forced set poisoned")
                            .insert(root_id, dry_run);
                    }
                }
                Err(LaunchSkip::Rejected) => {}
            }
        }
        handles
    }

    /// Spawns the background loop: a `select!` over the tick interval and the
    /// command channel.
    #[must_use]
    pub fn start(self) -> SchedulerHandle {
        let (command_tx, mut command_rx) = mpsc::channel::<SchedulerCommand>(16);
        let status = self.inner.status.clone();
        let scheduler = self.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.inner.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = scheduler.tick().await;
                    }
                    cmd = command_rx.recv() => {
                        match cmd {
                            Some(SchedulerCommand::ScanNow { root_id, dry_run }) => {
                                match scheduler
                                    .inner
                                    .registry
                                    .authorize(&root_id, &scheduler.inner.requester)
                                    .await
                                {
                                    Ok(_) => {
                                        scheduler
                                            .inner
                                            .forced
                                            .lock()
                                            .expect("forced set poisoned")
                                            .insert(root_id, dry_run);
                                        let _ = scheduler.tick().await;
                                    }
                                    Err(err) => log::warn!("scan-now rejected: {err}"),
                                }
                            }
                            Some(SchedulerCommand::Pause(root_id)) => {
                                scheduler.set_paused(&root_id, true).await;
                            }
                            Some(SchedulerCommand::Resume(root_id)) => {
                                scheduler.set_paused(&root_id, false).await;
                            }
                            Some(SchedulerCommand::Shutdown) | None => break,
                        }
                    }
                }
            }
            scheduler.release_lease();
        });

        SchedulerHandle {
            command_tx,
            status,
            join,
        }
    }

    async fn set_paused(&self, root_id: &RootId, paused: bool) {
        match self
            .inner
            .registry
            .set_paused(root_id, &self.inner.requester, paused)
            .await
        {
            Ok(root) => self.inner.status.set_paused(&root),
            Err(err) => log::warn!("pause/resume rejected: {err}"),
        }
    }

    /// For the server variant: true when the lease is held (acquiring it now
    /// if possible). "Held elsewhere" is an idle tick, not an error. The
    /// client variant needs no lease.
    fn ensure_lease(&self) -> bool {
        let Some(lease) = &self.inner.lease else {
            return true;
        };
        let mut guard = lease.guard.lock().expect("lease guard poisoned");
        if guard.is_some() {
            return true;
        }
        match lease.coordinator.try_acquire(SERVER_SCHEDULER_LEASE) {
            Ok(Some(acquired)) => {
                *guard = Some(acquired);
                true
            }
            Ok(None) => {
                log::debug!("Server scheduler lease held elsewhere; staying idle");
                false
            }
            Err(err) => {
                log::warn!("Lease acquisition failed: {err}");
                false
            }
        }
    }

    fn release_lease(&self) {
        if let Some(lease) = &self.inner.lease {
            let mut guard = lease.guard.lock().expect("lease guard poisoned");
            guard.take();
        }
    }

    fn running_count(&self, root_id: &RootId) -> u32 {
        let in_flight = self.inner.in_flight.lock().expect("in-flight map poisoned");
        in_flight.get(root_id).copied().unwrap_or(0)
    }

    async fn launch(
        &self,
        root: WatchedRoot,
        dry_run: bool,
    ) -> std::result::Result<JoinHandle<()>, LaunchSkip> {
        // Defense in depth: the list query already filtered by scope, but the
        // registry row may have moved since; re-validate before acting.
        let requester = self.inner.requester.clone();
        let root = match self.inner.registry.authorize(&root.root_id, &requester).await {
            Ok(root) => root,
            Err(err) => {
                log::warn!("Skipping root: {err}");
                return Err(LaunchSkip::Rejected);
            }
        };

        // One slot key per unit of allowed concurrency, so `max_concurrency`
        // holds across processes, not just against this loop's counter.
        let token = match self.inner.locks.acquire_slot(
            root.root_id.as_str(),
            root.max_concurrency,
            &self.inner.holder_id,
            self.inner.config.lock_ttl,
        ) {
            Ok(token) => token,
            Err(LockError::LockHeld {
                holder_id,
                expires_in,
            }) => {
                log::debug!(
                    "Root {} locked by {holder_id} ({}s left); skipping this tick",
                    root.root_id,
                    expires_in.as_secs()
                );
                return Err(LaunchSkip::Contended);
            }
            Err(err) => {
                log::warn!("Lock acquisition failed for {}: {err}", root.root_id);
                return Err(LaunchSkip::Rejected);
            }
        };

        // Dry runs verify a root without disturbing its schedule anchors.
        let root = if dry_run {
            root
        } else {
            match self
                .inner
                .registry
                .mark_scan_started(&root.root_id, &requester)
                .await
            {
                Ok(root) => root,
                Err(err) => {
                    log::warn!("Failed to mark scan start for {}: {err}", root.root_id);
                    self.inner.locks.release(&token);
                    return Err(LaunchSkip::Rejected);
                }
            }
        };

        let run = IndexingRun::started(&root, dry_run);
        self.inner.status.run_started(&run);
        {
            let mut in_flight = self.inner.in_flight.lock().expect("in-flight map poisoned");
            *in_flight.entry(root.root_id.clone()).or_insert(0) += 1;
        }

        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let result = inner.executor.execute(&root, dry_run).await;
            let (success, completed) = match result {
                Ok(outcome) => (outcome.succeeded(), run.completed_with(outcome)),
                Err(err) => {
                    log::error!("Scan of root {} failed: {err}", root.root_id);
                    (false, run.failed_with(err.to_string()))
                }
            };

            let post_run = if dry_run {
                Ok(root.clone())
            } else {
                inner
                    .registry
                    .record_outcome(&root.root_id, &requester, success)
                    .await
            };
            match post_run {
                Ok(updated) => {
                    if let Err(err) = inner.status.run_completed(completed, &updated).await {
                        log::warn!(
                            "Failed to persist health snapshot for {}: {err}",
                            root.root_id
                        );
                    }
                }
                Err(err) => log::error!("Failed to record outcome for {}: {err}", root.root_id),
            }

            inner.locks.release(&token);
            let mut in_flight = inner.in_flight.lock().expect("in-flight map poisoned");
            if let Some(count) = in_flight.get_mut(&root.root_id) {
                *count = count.saturating_sub(1);
            }
        }))
    }
}

#[derive(Debug)]
pub enum SchedulerCommand {
    ScanNow { root_id: RootId, dry_run: bool },
    Pause(RootId),
    Resume(RootId),
    Shutdown,
}

/// Control handle over a running scheduler loop.
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    status: Arc<StatusStore>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn scan_now(&self, root_id: RootId, dry_run: bool) -> crate::Result<()> {
        self.command_tx
            .send(SchedulerCommand::ScanNow { root_id, dry_run })
            .await
            .map_err(|_| crate::SchedulerError::Stopped)
    }

    pub async fn pause(&self, root_id: RootId) -> crate::Result<()> {
        self.command_tx
            .send(SchedulerCommand::Pause(root_id))
            .await
            .map_err(|_| crate::SchedulerError::Stopped)
    }

    pub async fn resume(&self, root_id: RootId) -> crate::Result<()> {
        self.command_tx
            .send(SchedulerCommand::Resume(root_id))
            .await
            .map_err(|_| crate::SchedulerError::Stopped)
    }

    #[must_use]
    pub fn status(&self) -> Arc<StatusStore> {
        self.status.clone()
    }

    /// Stops the loop and releases the lease. In-flight scans finish on
    /// their own; their locks age out if the process dies first.
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(SchedulerCommand::Shutdown).await;
        let _ = self.join.await;
    }
}
