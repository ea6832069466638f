//! Finds work that a crashed or stalled executor left behind and puts it
//! back in the queue.
//!
//! Every action is re-checked against persisted state and committed under a
//! guard, so running recovery twice, or on two engines at once, dispatches
//! each stuck element at most once.
//!
//! A claim counts as abandoned only once its holder stopped refreshing it:
//! running items heartbeat through `WorkItemRepository::touch_claim`.

use crate::application::work_executor::WorkExecutorService;
use crate::domain::container::{ContainerRef, ContainerState};
use crate::domain::process_instance::ProcessInstanceId;
use crate::domain::repository::{Guard, StateStore, UnitOfWork};
use crate::domain::work_item::WorkItem;
use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a recovery pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Abandoned claims put back in the queue
    pub released_claims: usize,
    /// Stale items that were still queued
    pub pending_items: usize,
    /// Flow nodes given a new advance work item
    pub resubmitted_flow_nodes: usize,
    /// Process instances given a new advance work item
    pub resubmitted_processes: usize,
}

impl RecoveryReport {
    /// Whether the pass found nothing to do
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Crash-recovery scanner
pub struct RecoveryService {
    store: Arc<dyn StateStore>,
    executor: WorkExecutorService,
    consider_older_than: RwLock<Duration>,
    run_lock: Mutex<()>,
}

impl RecoveryService {
    /// Create a recovery service for the work handled by `executor`
    pub fn new(
        store: Arc<dyn StateStore>,
        executor: WorkExecutorService,
        consider_older_than: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            consider_older_than: RwLock::new(consider_older_than),
            run_lock: Mutex::new(()),
        }
    }

    /// Elements untouched for longer than `threshold` are considered stuck
    pub fn set_consider_elements_older_than(&self, threshold: Duration) {
        match self.consider_older_than.write() {
            Ok(mut current) => *current = threshold,
            Err(poisoned) => *poisoned.into_inner() = threshold,
        }
        debug!(threshold_ms = threshold.as_millis() as u64, "Recovery threshold changed");
    }

    /// Current staleness threshold
    pub fn consider_elements_older_than(&self) -> Duration {
        match self.consider_older_than.read() {
            Ok(current) => *current,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Run one recovery pass
    pub async fn recover_all_elements(&self) -> Result<RecoveryReport, CoreError> {
        let _running = self.run_lock.lock().await;

        let threshold = chrono::Duration::from_std(self.consider_elements_older_than())
            .map_err(|e| CoreError::ConfigurationError(format!("Invalid recovery threshold: {}", e)))?;
        let older_than = Utc::now() - threshold;
        let mut report = RecoveryReport::default();

        for item in self.store.find_stale_work_items(older_than).await? {
            if !item.is_claimed() {
                report.pending_items += 1;
                continue;
            }
            if self.executor.is_in_flight(&item.id) {
                continue;
            }
            let Some(claimant) = item.claimed_by.clone() else {
                continue;
            };

            let unit = UnitOfWork::new()
                .guard(Guard::WorkClaimedBy {
                    id: item.id.clone(),
                    executor: claimant.clone(),
                })
                .release(item.id.clone());
            match self.store.commit(unit).await {
                Ok(()) => {
                    info!(
                        work_item_id = %item.id,
                        claimed_by = %claimant,
                        sequence_key = %item.sequence_key,
                        "Released abandoned work item"
                    );
                    report.released_claims += 1;
                }
                Err(CoreError::ConcurrentModification(_)) => {
                    debug!(work_item_id = %item.id, "Work item changed during recovery")
                }
                Err(e) => return Err(e),
            }
        }

        for node in self.store.find_stale_flow_nodes(older_than).await? {
            let Some(current) = self.store.find_flow_node(&node.id).await? else {
                continue;
            };
            if !is_stuck(current.state, current.last_update, older_than) {
                continue;
            }
            let guard = Guard::FlowNodeState {
                id: current.id.clone(),
                expected: current.state,
            };
            if self
                .resubmit(&current.process_instance_id, current.container(), guard)
                .await?
            {
                report.resubmitted_flow_nodes += 1;
            }
        }

        for process in self.store.find_stale_process_instances(older_than).await? {
            let Some(current) = self.store.find_process_instance(&process.id).await? else {
                continue;
            };
            if !is_stuck(current.state, current.last_update, older_than) {
                continue;
            }
            // Halted behind a failed flow node, waiting for an operator
            if self
                .store
                .find_flow_nodes_of_process(&current.id)
                .await?
                .iter()
                .any(|node| node.state == ContainerState::Failed)
            {
                continue;
            }
            let guard = Guard::ProcessState {
                id: current.id.clone(),
                expected: current.state,
            };
            if self.resubmit(&current.id, current.container(), guard).await? {
                report.resubmitted_processes += 1;
            }
        }

        if !report.is_empty() {
            self.executor.notify_work_available();
            info!(
                released_claims = report.released_claims,
                pending_items = report.pending_items,
                resubmitted_flow_nodes = report.resubmitted_flow_nodes,
                resubmitted_processes = report.resubmitted_processes,
                "Recovery pass finished"
            );
        }
        Ok(report)
    }

    /// Queue an advance of the container unless any work exists for it
    async fn resubmit(
        &self,
        process_instance_id: &ProcessInstanceId,
        container: ContainerRef,
        state_guard: Guard,
    ) -> Result<bool, CoreError> {
        let sequence_key = container.sequence_key();
        if !self.store.find_work_for_sequence(&sequence_key).await?.is_empty() {
            return Ok(false);
        }

        let unit = UnitOfWork::new()
            .guard(Guard::NoWorkFor {
                sequence_key: sequence_key.clone(),
            })
            .guard(state_guard)
            .enqueue(WorkItem::advance(process_instance_id.clone(), container));
        match self.store.commit(unit).await {
            Ok(()) => {
                info!(sequence_key = %sequence_key, "Resubmitted stuck element");
                Ok(true)
            }
            Err(CoreError::ConcurrentModification(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run recovery every `interval`, starting now, until `cancel` fires
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.recover_all_elements().await {
                            warn!(error = %e, "Recovery pass failed");
                        }
                    }
                }
            }
            debug!("Periodic recovery stopped");
        })
    }
}

fn is_stuck(state: ContainerState, last_update: DateTime<Utc>, older_than: DateTime<Utc>) -> bool {
    state.is_active() && last_update < older_than
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_active_and_old_elements_are_stuck() {
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(120);
        let cutoff = now - chrono::Duration::seconds(60);

        assert!(is_stuck(ContainerState::ExecutingOnEnterConnectors, old, cutoff));
        assert!(!is_stuck(ContainerState::ExecutingOnEnterConnectors, now, cutoff));
        assert!(!is_stuck(ContainerState::Failed, old, cutoff));
        assert!(!is_stuck(ContainerState::Completed, old, cutoff));
    }

    #[test]
    fn test_empty_report() {
        let mut report = RecoveryReport::default();
        assert!(report.is_empty());
        report.pending_items = 1;
        assert!(!report.is_empty());
    }
}
