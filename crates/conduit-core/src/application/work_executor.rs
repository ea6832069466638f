//!
//! Work executor service
//! Bounded worker pool draining the persisted work queue, with an explicit
//! Stopped / Running / Paused lifecycle.
//!

use crate::domain::failure::{FailureInfo, FailureKind};
use crate::domain::repository::{Guard, StateStore, UnitOfWork};
use crate::domain::work_item::{ExecutorId, WorkItem, WorkItemId};
use crate::{CoreError, EngineConfig};
use async_trait::async_trait;
use dashmap::DashSet;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Executes claimed work items
#[async_trait]
pub trait WorkHandler: Send + Sync {
    /// Perform the work. The item stays claimed by `executor` until the
    /// handler's commit deletes or releases it.
    async fn handle(&self, item: &WorkItem, executor: &ExecutorId) -> Result<(), CoreError>;

    /// Persist the outcome of work that errored or panicked
    async fn handle_failure(
        &self,
        item: &WorkItem,
        executor: &ExecutorId,
        failure: FailureInfo,
    ) -> Result<(), CoreError>;
}

/// Lifecycle of the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorLifecycle {
    /// Not started, or shut down
    Stopped,
    /// Claiming and executing work
    Running,
    /// Not claiming; queued work is kept
    Paused,
}

impl fmt::Display for ExecutorLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutorLifecycle::Stopped => "STOPPED",
            ExecutorLifecycle::Running => "RUNNING",
            ExecutorLifecycle::Paused => "PAUSED",
        };
        write!(f, "{}", name)
    }
}

/// Work executor configuration
#[derive(Debug, Clone)]
pub struct WorkExecutorConfig {
    /// Maximum number of items executing at once
    pub worker_count: usize,

    /// Idle wait between polls of the queue
    pub poll_interval: Duration,

    /// Claims of one item before a lost race is treated as a failure
    pub max_attempts: u32,

    /// How long `shutdown` waits for in-flight work before aborting it
    pub shutdown_grace: Duration,

    /// How often a running item refreshes its claim. Must stay well below
    /// the recovery threshold of every engine sharing the store.
    pub heartbeat_interval: Duration,
}

impl Default for WorkExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_millis(200),
            max_attempts: 5,
            shutdown_grace: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

impl From<&EngineConfig> for WorkExecutorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            poll_interval: config.poll_interval(),
            max_attempts: config.max_attempts,
            heartbeat_interval: (config.recovery.consider_older_than() / 3)
                .max(Duration::from_millis(10)),
            ..Self::default()
        }
    }
}

struct Inner {
    executor_id: ExecutorId,
    store: Arc<dyn StateStore>,
    handler: Arc<dyn WorkHandler>,
    config: WorkExecutorConfig,
    lifecycle: watch::Sender<ExecutorLifecycle>,
    /// Slots taken by the dispatcher, including items still being claimed
    active: watch::Sender<usize>,
    in_flight: DashSet<WorkItemId>,
    wake: Notify,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<JoinSet<()>>>>,
}

/// A taken execution slot. Dropping it, including when the task holding it
/// is aborted, frees the slot.
struct WorkSlot {
    inner: Arc<Inner>,
    item: Option<WorkItemId>,
    _permit: OwnedSemaphorePermit,
}

impl WorkSlot {
    fn take(inner: Arc<Inner>, permit: OwnedSemaphorePermit) -> Self {
        inner.active.send_modify(|n| *n += 1);
        Self {
            inner,
            item: None,
            _permit: permit,
        }
    }

    fn track(&mut self, id: WorkItemId) {
        self.inner.in_flight.insert(id.clone());
        self.item = Some(id);
    }
}

impl Drop for WorkSlot {
    fn drop(&mut self) {
        if let Some(id) = self.item.take() {
            self.inner.in_flight.remove(&id);
        }
        self.inner.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Bounded pool consuming persisted work items
#[derive(Clone)]
pub struct WorkExecutorService {
    inner: Arc<Inner>,
}

impl WorkExecutorService {
    /// Create a stopped executor with a fresh executor id
    pub fn new(
        store: Arc<dyn StateStore>,
        handler: Arc<dyn WorkHandler>,
        config: WorkExecutorConfig,
    ) -> Self {
        let worker_count = config.worker_count.max(1);
        let (lifecycle, _) = watch::channel(ExecutorLifecycle::Stopped);
        let (active, _) = watch::channel(0usize);
        Self {
            inner: Arc::new(Inner {
                executor_id: ExecutorId::generate(),
                store,
                handler,
                config,
                lifecycle,
                active,
                in_flight: DashSet::new(),
                wake: Notify::new(),
                permits: Arc::new(Semaphore::new(worker_count)),
                cancel: CancellationToken::new(),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Identity used when claiming work
    pub fn executor_id(&self) -> &ExecutorId {
        &self.inner.executor_id
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> ExecutorLifecycle {
        *self.inner.lifecycle.borrow()
    }

    /// Observe lifecycle changes
    pub fn subscribe_lifecycle(&self) -> watch::Receiver<ExecutorLifecycle> {
        self.inner.lifecycle.subscribe()
    }

    /// Number of items currently executing
    pub fn active_count(&self) -> usize {
        *self.inner.active.borrow()
    }

    /// Whether this executor is running the given item right now
    pub fn is_in_flight(&self, id: &WorkItemId) -> bool {
        self.inner.in_flight.contains(id)
    }

    /// Wake the dispatcher; new work is picked up without waiting for the
    /// next poll
    pub fn notify_work_available(&self) {
        self.inner.wake.notify_one();
    }

    /// Start claiming work
    pub async fn start(&self) -> Result<(), CoreError> {
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::InvalidStateTransition(
                "Work executor has been shut down".to_string(),
            ));
        }

        let mut dispatcher = self.inner.dispatcher.lock().await;
        if dispatcher.is_some() {
            return Ok(());
        }

        self.inner.lifecycle.send_replace(ExecutorLifecycle::Running);
        *dispatcher = Some(tokio::spawn(dispatch_loop(self.inner.clone())));
        info!(
            executor_id = %self.inner.executor_id,
            worker_count = self.inner.config.worker_count,
            "Work executor started"
        );
        Ok(())
    }

    /// Stop claiming new work and wait until every in-flight item finished.
    /// Queued work stays in the store.
    pub async fn pause(&self) {
        let paused = self.inner.lifecycle.send_if_modified(|state| {
            if *state == ExecutorLifecycle::Running {
                *state = ExecutorLifecycle::Paused;
                true
            } else {
                false
            }
        });
        if paused {
            info!(executor_id = %self.inner.executor_id, "Pausing work executor");
        }

        let mut active = self.inner.active.subscribe();
        let _ = active.wait_for(|n| *n == 0).await;
        debug!(executor_id = %self.inner.executor_id, "No work in flight");
    }

    /// Resume claiming work after `pause`
    pub fn resume(&self) {
        let resumed = self.inner.lifecycle.send_if_modified(|state| {
            if *state == ExecutorLifecycle::Paused {
                *state = ExecutorLifecycle::Running;
                true
            } else {
                false
            }
        });
        if resumed {
            info!(executor_id = %self.inner.executor_id, "Resuming work executor");
            self.inner.wake.notify_one();
        }
    }

    /// Stop claiming, wait for in-flight work and stop the dispatcher
    pub async fn shutdown(&self) {
        self.shutdown_with_timeout(self.inner.config.shutdown_grace)
            .await
    }

    /// Like [`shutdown`](Self::shutdown), but in-flight work still running
    /// after `grace` is aborted. Aborted work keeps its claim in the store
    /// until recovery releases it.
    pub async fn shutdown_with_timeout(&self, grace: Duration) {
        self.inner.cancel.cancel();

        let handle = self.inner.dispatcher.lock().await.take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(mut tasks) => {
                    let drained = tokio::time::timeout(grace, async {
                        while tasks.join_next().await.is_some() {}
                    })
                    .await;
                    if drained.is_err() {
                        warn!(
                            executor_id = %self.inner.executor_id,
                            remaining = tasks.len(),
                            "Aborting work still running after shutdown grace period"
                        );
                        tasks.abort_all();
                        while tasks.join_next().await.is_some() {}
                    }
                }
                Err(e) => error!(executor_id = %self.inner.executor_id, error = %e, "Dispatcher task failed"),
            }
        }

        self.inner.lifecycle.send_replace(ExecutorLifecycle::Stopped);
        info!(executor_id = %self.inner.executor_id, "Work executor stopped");
    }
}

async fn dispatch_loop(inner: Arc<Inner>) -> JoinSet<()> {
    let mut tasks = JoinSet::new();
    let mut lifecycle = inner.lifecycle.subscribe();

    loop {
        while let Some(Some(joined)) = tasks.join_next().now_or_never() {
            if let Err(e) = joined {
                error!(executor_id = %inner.executor_id, error = %e, "Work task ended abnormally");
            }
        }

        if *lifecycle.borrow_and_update() != ExecutorLifecycle::Running {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                changed = lifecycle.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }

        let permit = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            permit = inner.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // Taken before the lifecycle re-check so `pause` cannot miss it
        let mut slot = WorkSlot::take(inner.clone(), permit);
        if *inner.lifecycle.borrow() != ExecutorLifecycle::Running || inner.cancel.is_cancelled() {
            continue;
        }

        match inner.store.claim_next_work_item(&inner.executor_id).await {
            Ok(Some(item)) => {
                debug!(
                    executor_id = %inner.executor_id,
                    work_item_id = %item.id,
                    sequence_key = %item.sequence_key,
                    attempts = item.attempts,
                    "Claimed work item"
                );
                slot.track(item.id.clone());
                tasks.spawn(run_item(inner.clone(), item, slot));
            }
            Ok(None) => {
                drop(slot);
                idle(&inner).await;
            }
            Err(e) => {
                drop(slot);
                error!(executor_id = %inner.executor_id, error = %e, "Failed to claim work");
                idle(&inner).await;
            }
        }
    }

    debug!(executor_id = %inner.executor_id, "Dispatcher stopped");
    tasks
}

async fn idle(inner: &Inner) {
    tokio::select! {
        _ = inner.cancel.cancelled() => {}
        _ = inner.wake.notified() => {}
        _ = tokio::time::sleep(inner.config.poll_interval) => {}
    }
}

async fn run_item(inner: Arc<Inner>, item: WorkItem, _slot: WorkSlot) {
    let executor = &inner.executor_id;
    let handled = AssertUnwindSafe(inner.handler.handle(&item, executor)).catch_unwind();
    tokio::pin!(handled);

    let period = inner.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let outcome = loop {
        tokio::select! {
            outcome = &mut handled => break outcome,
            _ = heartbeat.tick() => touch_claim(&inner, &item).await,
        }
    };

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(CoreError::ConcurrentModification(reason))) => {
            if item.attempts < inner.config.max_attempts {
                debug!(
                    work_item_id = %item.id,
                    attempts = item.attempts,
                    reason = %reason,
                    "Lost a race on work item, releasing it"
                );
                release_claim(&inner, &item).await;
                None
            } else {
                Some(
                    FailureInfo::new(
                        FailureKind::Execution,
                        format!("Gave up after {} conflicting attempts", item.attempts),
                    )
                    .with_cause(reason),
                )
            }
        }
        Ok(Err(e)) => Some(FailureInfo::from_core_error(&e)),
        Err(panic) => Some(FailureInfo::from_panic(panic)),
    };

    if let Some(failure) = failure {
        warn!(
            work_item_id = %item.id,
            executor_id = %executor,
            failure = %failure,
            "Work item failed"
        );
        let recorded = AssertUnwindSafe(inner.handler.handle_failure(&item, executor, failure))
            .catch_unwind()
            .await;
        match recorded {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(work_item_id = %item.id, error = %e, "Could not record work failure");
                release_claim(&inner, &item).await;
            }
            Err(_) => {
                error!(work_item_id = %item.id, "Failure handler panicked");
                release_claim(&inner, &item).await;
            }
        }
    }

    inner.wake.notify_one();
}

async fn touch_claim(inner: &Inner, item: &WorkItem) {
    match inner.store.touch_claim(&item.id, &inner.executor_id).await {
        Ok(true) => debug!(work_item_id = %item.id, "Refreshed work claim"),
        Ok(false) => warn!(
            work_item_id = %item.id,
            executor_id = %inner.executor_id,
            "Work claim no longer held by this executor"
        ),
        Err(e) => warn!(work_item_id = %item.id, error = %e, "Could not refresh work claim"),
    }
}

async fn release_claim(inner: &Inner, item: &WorkItem) {
    let unit = UnitOfWork::new()
        .guard(Guard::WorkClaimedBy {
            id: item.id.clone(),
            executor: inner.executor_id.clone(),
        })
        .release(item.id.clone());
    if let Err(e) = inner.store.commit(unit).await {
        debug!(work_item_id = %item.id, error = %e, "Claim already gone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_engine_config() {
        let mut engine = EngineConfig::default();
        engine.worker_count = 9;
        engine.poll_interval_ms = 25;
        let config = WorkExecutorConfig::from(&engine);
        assert_eq!(config.worker_count, 9);
        assert_eq!(config.poll_interval, Duration::from_millis(25));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(20));

        engine.recovery.consider_older_than_ms = 3;
        let config = WorkExecutorConfig::from(&engine);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_lifecycle_display() {
        assert_eq!(ExecutorLifecycle::Paused.to_string(), "PAUSED");
        assert_eq!(ExecutorLifecycle::Stopped.to_string(), "STOPPED");
    }
}
