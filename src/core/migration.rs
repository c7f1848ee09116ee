/*
* Live Migration Coordinator
* --------------------------
* @project: ha-vm-manager
*
* `crm resource move` returns as soon as Pacemaker has accepted the new
* location constraint. The VM is nowhere near the target yet, so after the
* move we keep asking crm_mon how the resource looks until it settles or we
* run out of attempts.
*
* Job lifecycle:
* -------------
*   Pending ──move accepted──> Polling ──policy satisfied──> Settled
*                                 │
*                                 ├──attempts exhausted──> TimedOut
*                                 └──abort()/shutdown()──> Aborted
*
* Rules:
* -----
* - one job per VM, reserved before the move command goes out
* - a failed poll is "no news", it still burns an attempt
* - the poller task is the only thing that ends a job; abort() just pulls
*   the cancellation token and the task walks out through the same door
* - every terminal state triggers one inventory refresh
* - the reservation is held by a guard, so even a panicking poller frees the
*   VM; the last finished job per VM stays readable afterwards
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::MigrationSettings;
use crate::core::inventory::InventoryStore;
use crate::core::vm::{CurrentNode, ResourceStatus, VmId};
use crate::errors::{ClusterError, ClusterResult, TargetRejection};

/// When a migration counts as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SettlementPolicy {
    /// Role is `Started` and the resource runs on the target node (or crm_mon
    /// does not list nodes at all).
    #[default]
    RoleStarted,
    /// The first observed role that is neither empty nor `Migrating`.
    LeftMigrating,
}

impl SettlementPolicy {
    pub fn is_settled(&self, status: &ResourceStatus, target: &str) -> bool {
        match self {
            SettlementPolicy::RoleStarted => {
                status.role == "Started"
                    && !status.failed
                    && status.nodes.iter().all(|node| node == target)
            }
            SettlementPolicy::LeftMigrating => {
                !status.role.is_empty() && status.role != "Migrating"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Polling,
    Settled,
    TimedOut,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Settled | JobStatus::TimedOut | JobStatus::Aborted)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationJob {
    pub id: Uuid,
    pub vm_id: VmId,
    pub vm_name: String,
    pub source_node: CurrentNode,
    pub target_node: String,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_observed_role: Option<String>,
}

/// Returned by [`MigrationCoordinator::request_migration`]; resolves once the
/// poller reaches a terminal state.
#[derive(Debug)]
pub struct MigrationHandle {
    job: MigrationJob,
    outcome: oneshot::Receiver<MigrationJob>,
}

impl MigrationHandle {
    /// The job as it was when polling started.
    pub fn job(&self) -> &MigrationJob {
        &self.job
    }

    pub async fn wait(self) -> ClusterResult<MigrationJob> {
        let vm_name = self.job.vm_name.clone();
        let job = self
            .outcome
            .await
            .map_err(|_| ClusterError::Aborted { vm_name: vm_name.clone() })?;

        match job.status {
            JobStatus::Settled => Ok(job),
            JobStatus::TimedOut => Err(ClusterError::TimedOut {
                vm_name,
                attempts: job.attempts_made,
            }),
            _ => Err(ClusterError::Aborted { vm_name }),
        }
    }
}

struct ActiveJob {
    state: Arc<Mutex<MigrationJob>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct JobBook {
    active: HashMap<String, ActiveJob>,
    // last job that ended for each VM, overwritten by the next one
    finished: HashMap<String, MigrationJob>,
}

type JobTable = Arc<Mutex<JobBook>>;

/// Owns one VM's slot in the job table. Dropping it frees the slot, whether
/// the poller finished, the move was refused, or the task panicked.
struct Reservation {
    jobs: JobTable,
    vm_name: String,
    state: Arc<Mutex<MigrationJob>>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let job = {
            let mut job = lock(&self.state);
            if job.status == JobStatus::Polling {
                // the poller died without reaching a terminal state
                job.status = JobStatus::Aborted;
                job.finished_at = Some(Utc::now());
            }
            job.clone()
        };

        let mut book = lock(&self.jobs);
        let ours = book
            .active
            .get(&self.vm_name)
            .map(|active| lock(&active.state).id == job.id)
            .unwrap_or(false);
        if ours {
            book.active.remove(&self.vm_name);
        }
        // a refused move never started, there is nothing to report
        if job.status.is_terminal() {
            book.finished.insert(self.vm_name.clone(), job);
        }
    }
}

pub struct MigrationCoordinator {
    store: Arc<InventoryStore>,
    settings: MigrationSettings,
    jobs: JobTable,
}

impl MigrationCoordinator {
    /// A zero poll interval or attempt budget is raised to 1.
    pub fn new(store: Arc<InventoryStore>, mut settings: MigrationSettings) -> Self {
        if settings.poll_interval_ms == 0 || settings.max_attempts == 0 {
            warn!(
                poll_interval_ms = settings.poll_interval_ms,
                max_attempts = settings.max_attempts,
                "migration settings must be non-zero, raising to 1"
            );
        }
        settings.poll_interval_ms = settings.poll_interval_ms.max(1);
        settings.max_attempts = settings.max_attempts.max(1);

        Self {
            store,
            settings,
            jobs: Arc::new(Mutex::new(JobBook::default())),
        }
    }

    pub fn settings(&self) -> &MigrationSettings {
        &self.settings
    }

    /// Validates the target, issues the move and starts polling.
    ///
    /// Fails synchronously for unknown VMs, invalid targets, a job already
    /// running for the VM, or a rejected move command. A timeout is only
    /// reported later through [`MigrationHandle::wait`].
    #[instrument(skip(self))]
    pub async fn request_migration(&self, vm_name: &str, target: &str) -> ClusterResult<MigrationHandle> {
        let vm = self.store.find_or_refresh(vm_name).await?;
        let resolver = self.store.resolver();

        let current = match resolver.resolve_current_node(vm_name).await {
            CurrentNode::Error => vm.current_node.clone(),
            fresh => fresh,
        };
        let online = resolver.online_nodes().await?;

        let rejection = if current.node() == Some(target) {
            Some(TargetRejection::SameAsCurrent)
        } else if !online.iter().any(|node| node == target) {
            Some(TargetRejection::NotOnline)
        } else {
            None
        };
        if let Some(reason) = rejection {
            return Err(ClusterError::InvalidTarget {
                vm_name: vm_name.to_string(),
                target: target.to_string(),
                reason,
            });
        }

        let job = MigrationJob {
            id: Uuid::new_v4(),
            vm_id: vm.id,
            vm_name: vm.name.clone(),
            source_node: current,
            target_node: target.to_string(),
            attempts_made: 0,
            max_attempts: self.settings.max_attempts,
            poll_interval_ms: self.settings.poll_interval_ms,
            status: JobStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            last_observed_role: None,
        };
        let state = Arc::new(Mutex::new(job));
        let cancel = CancellationToken::new();

        {
            let mut book = lock(&self.jobs);
            if book.active.contains_key(vm_name) {
                return Err(ClusterError::MigrationInProgress {
                    vm_name: vm_name.to_string(),
                });
            }
            book.active.insert(
                vm_name.to_string(),
                ActiveJob {
                    state: state.clone(),
                    cancel: cancel.clone(),
                },
            );
        }
        let reservation = Reservation {
            jobs: self.jobs.clone(),
            vm_name: vm_name.to_string(),
            state: state.clone(),
        };

        if let Err(e) = resolver.source().move_resource(vm_name, target).await {
            error!(vm = vm_name, target, error = %e, "move request rejected");
            return Err(e);
        }

        let job = {
            let mut job = lock(&state);
            job.status = JobStatus::Polling;
            job.clone()
        };
        info!(vm = vm_name, target, job_id = %job.id, "migration submitted, polling");

        let (tx, outcome) = oneshot::channel();
        tokio::spawn(poll_until_settled(
            self.store.clone(),
            self.settings.settlement_policy,
            state,
            cancel,
            reservation,
            tx,
        ));

        Ok(MigrationHandle { job, outcome })
    }

    /// Stops polling for `vm_name`. Returns false if no job was running.
    pub fn abort(&self, vm_name: &str) -> bool {
        match lock(&self.jobs).active.get(vm_name) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        for active in lock(&self.jobs).active.values() {
            active.cancel.cancel();
        }
    }

    pub fn active_jobs(&self) -> Vec<MigrationJob> {
        let mut jobs: Vec<MigrationJob> = lock(&self.jobs)
            .active
            .values()
            .map(|active| lock(&active.state).clone())
            .collect();
        jobs.sort_by(|a, b| a.vm_name.cmp(&b.vm_name));
        jobs
    }

    pub fn active_job(&self, vm_name: &str) -> Option<MigrationJob> {
        lock(&self.jobs)
            .active
            .get(vm_name)
            .map(|active| lock(&active.state).clone())
    }

    /// The most recent job for `vm_name` that reached a terminal state.
    pub fn finished_job(&self, vm_name: &str) -> Option<MigrationJob> {
        lock(&self.jobs).finished.get(vm_name).cloned()
    }

    /// The running job if there is one, otherwise the last finished one.
    pub fn latest_job(&self, vm_name: &str) -> Option<MigrationJob> {
        self.active_job(vm_name).or_else(|| self.finished_job(vm_name))
    }
}

async fn poll_until_settled(
    store: Arc<InventoryStore>,
    policy: SettlementPolicy,
    state: Arc<Mutex<MigrationJob>>,
    cancel: CancellationToken,
    reservation: Reservation,
    outcome: oneshot::Sender<MigrationJob>,
) {
    let (vm_name, target, max_attempts, period) = {
        let job = lock(&state);
        (
            job.vm_name.clone(),
            job.target_node.clone(),
            job.max_attempts,
            std::time::Duration::from_millis(job.poll_interval_ms),
        )
    };

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let status = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break JobStatus::Aborted,
            _ = ticker.tick() => {}
        }

        let observed = tokio::select! {
            biased;
            _ = cancel.cancelled() => break JobStatus::Aborted,
            observed = store.resolver().resource_status(&vm_name) => observed,
        };

        let attempts = {
            let mut job = lock(&state);
            job.attempts_made += 1;
            if let Ok(status) = &observed {
                job.last_observed_role = Some(status.role.clone());
            }
            job.attempts_made
        };

        match observed {
            Ok(status) if policy.is_settled(&status, &target) => break JobStatus::Settled,
            Ok(status) => {
                info!(vm = %vm_name, attempt = attempts, role = %status.role, nodes = ?status.nodes, "migration not settled yet");
            }
            Err(e) => {
                warn!(vm = %vm_name, attempt = attempts, error = %e, "migration poll failed");
            }
        }

        if attempts >= max_attempts {
            break JobStatus::TimedOut;
        }
    };

    let job = {
        let mut job = lock(&state);
        job.status = status;
        job.finished_at = Some(Utc::now());
        job.clone()
    };

    match status {
        JobStatus::Settled => info!(vm = %vm_name, target = %target, attempts = job.attempts_made, "migration settled"),
        JobStatus::TimedOut => warn!(vm = %vm_name, target = %target, attempts = job.attempts_made, "migration did not settle in time"),
        _ => info!(vm = %vm_name, "migration polling aborted"),
    }

    if let Err(e) = store.refresh().await {
        warn!(vm = %vm_name, error = %e, "inventory refresh after migration failed");
    }

    drop(reservation);
    // receiver may have been dropped, nobody is waiting then
    let _ = outcome.send(job);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
