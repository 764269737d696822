// Copyright 2023 The SeamDB Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Background scans moving sessions forward without their transaction managers: timed out
//! transactions are rolled back, retrying and orphaned ones are driven again and
//! asynchronously committed ones are finished.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use derive_where::derive_where;
use futures::stream::{self, StreamExt};
use rand::Rng;
use tokio::select;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::{Coordinator, CoordinatorConfig, Result};
use crate::clock::millis_of;
use crate::locker::DistributedLocker;
use crate::session::{GlobalSession, GlobalStatus};
use crate::utils::{self, DropOwner, DropWatcher};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScanKind {
    TimeoutCheck,
    RetryCommitting,
    AsyncCommitting,
    RetryRollbacking,
    UndoLogDelete,
}

impl ScanKind {
    pub const ALL: [ScanKind; 5] = [
        ScanKind::TimeoutCheck,
        ScanKind::RetryCommitting,
        ScanKind::AsyncCommitting,
        ScanKind::RetryRollbacking,
        ScanKind::UndoLogDelete,
    ];

    /// Name of the distributed lock guarding this scan across coordinators.
    pub fn lock_name(self) -> &'static str {
        match self {
            ScanKind::TimeoutCheck => "TxTimeoutCheck",
            ScanKind::RetryCommitting => "RetryCommitting",
            ScanKind::AsyncCommitting => "AsyncCommitting",
            ScanKind::RetryRollbacking => "RetryRollbacking",
            ScanKind::UndoLogDelete => "UndoLogDelete",
        }
    }

    fn period(self, config: &CoordinatorConfig) -> Duration {
        let period = match self {
            ScanKind::TimeoutCheck => config.timeout_retry_period,
            ScanKind::RetryCommitting => config.committing_retry_period,
            ScanKind::AsyncCommitting => config.async_committing_retry_period,
            ScanKind::RetryRollbacking => config.rollbacking_retry_period,
            ScanKind::UndoLogDelete => config.undo_log_delete_period,
        };
        period.max(Duration::from_millis(1))
    }
}

impl Coordinator {
    /// Runs one pass of `kind` and returns the number of sessions it handled.
    pub async fn scan(&self, kind: ScanKind) -> Result<usize> {
        match kind {
            ScanKind::TimeoutCheck => self.timeout_check().await,
            ScanKind::RetryCommitting => self.handle_retry_committing().await,
            ScanKind::AsyncCommitting => self.handle_async_committing().await,
            ScanKind::RetryRollbacking => self.handle_retry_rollbacking().await,
            ScanKind::UndoLogDelete => self.undo_log_delete().await,
        }
    }

    /// Whether no one has driven `session` for so long that its driver is presumably gone.
    fn is_orphaned(&self, session: &GlobalSession) -> bool {
        self.inner.clock.elapsed_since(session.gmt_updated) >= self.inner.config.dead_session_threshold
    }

    async fn candidates(
        &self,
        statuses: &[GlobalStatus],
        eligible: impl Fn(&GlobalSession) -> bool,
    ) -> Result<Vec<String>> {
        let sessions = self.inner.store.find_global_sessions(statuses).await?;
        Ok(sessions.into_iter().filter(|session| eligible(session)).map(|session| session.xid).collect())
    }

    async fn handle_each<F, Fut>(&self, xids: Vec<String>, handle: F) -> usize
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<bool>>, {
        let handled: Vec<bool> = stream::iter(xids)
            .map(|xid| {
                let handling = handle(xid.clone());
                async move {
                    match handling.await {
                        Ok(handled) => handled,
                        Err(err) => {
                            warn!("fail to handle global transaction {xid}: {err}");
                            false
                        },
                    }
                }
            })
            .buffer_unordered(self.inner.config.scan_parallelism)
            .collect()
            .await;
        handled.into_iter().filter(|handled| *handled).count()
    }

    /// Reloads `xid` if it is still eligible. Scans skip xids being handled in this process.
    async fn reload(&self, xid: &str, eligible: impl Fn(&GlobalSession) -> bool) -> Result<Option<GlobalSession>> {
        let session = self.inner.store.find_global_session(xid).await?;
        Ok(session.filter(|session| eligible(session)))
    }

    /// Starts rollback of timed out `Begin` sessions.
    #[instrument(skip_all)]
    pub async fn timeout_check(&self) -> Result<usize> {
        let now = self.now();
        let xids = self.candidates(&[GlobalStatus::Begin], |session| session.is_timed_out(now)).await?;
        Ok(self.handle_each(xids, |xid| self.rollback_timed_out(xid)).await)
    }

    #[instrument(skip(self))]
    async fn rollback_timed_out(&self, xid: String) -> Result<bool> {
        let Some(_latch) = self.inner.latches.try_lock(&xid) else {
            return Ok(false);
        };
        let now = self.now();
        let eligible = |session: &GlobalSession| session.status == GlobalStatus::Begin && session.is_timed_out(now);
        let Some(mut session) = self.reload(&xid, eligible).await? else {
            return Ok(false);
        };
        let overdue = Duration::from_millis(now.saturating_sub(session.deadline()));
        let status = match overdue >= self.inner.config.timeout_rollback_grace {
            true => GlobalStatus::TimeoutRollbacking,
            false => GlobalStatus::Rollbacking,
        };
        self.transit_and_persist(&mut session, status).await?;
        info!("global transaction {xid} timed out after {:?}, start {status}", session.timeout);
        self.drive_rollback(session).await?;
        Ok(true)
    }

    fn is_retry_committing(&self, session: &GlobalSession) -> bool {
        match session.status {
            GlobalStatus::CommitRetrying => true,
            GlobalStatus::Committing => self.is_orphaned(session),
            GlobalStatus::Committed => !session.has_branch(),
            _ => false,
        }
    }

    /// Drives `CommitRetrying` and orphaned `Committing` sessions again.
    #[instrument(skip_all)]
    pub async fn handle_retry_committing(&self) -> Result<usize> {
        let statuses = [GlobalStatus::CommitRetrying, GlobalStatus::Committing, GlobalStatus::Committed];
        let xids = self.candidates(&statuses, |session| self.is_retry_committing(session)).await?;
        Ok(self.handle_each(xids, |xid| self.retry_commit(xid)).await)
    }

    #[instrument(skip(self))]
    async fn retry_commit(&self, xid: String) -> Result<bool> {
        let Some(_latch) = self.inner.latches.try_lock(&xid) else {
            return Ok(false);
        };
        let Some(mut session) = self.reload(&xid, |session| self.is_retry_committing(session)).await? else {
            return Ok(false);
        };
        if session.status == GlobalStatus::Committed {
            self.end_session(&session).await?;
            return Ok(true);
        }
        let exhausted = self
            .inner
            .config
            .max_commit_retry_timeout
            .is_some_and(|max| self.inner.clock.elapsed_since(session.begin_time) >= max);
        if exhausted {
            if session.status == GlobalStatus::Committing {
                session.transit(GlobalStatus::CommitRetrying, self.now())?;
            }
            self.transit_and_persist(&mut session, GlobalStatus::CommitRetryTimeout).await?;
            error!("global transaction {xid} exhausted commit retries, operator attention required");
            return Ok(true);
        }
        self.drive_commit(session).await?;
        Ok(true)
    }

    /// Finishes branch commits of sessions committed asynchronously.
    #[instrument(skip_all)]
    pub async fn handle_async_committing(&self) -> Result<usize> {
        let xids = self.candidates(&[GlobalStatus::AsyncCommitting], |_| true).await?;
        Ok(self.handle_each(xids, |xid| self.commit_async(xid)).await)
    }

    #[instrument(skip(self))]
    async fn commit_async(&self, xid: String) -> Result<bool> {
        let Some(_latch) = self.inner.latches.try_lock(&xid) else {
            return Ok(false);
        };
        let eligible = |session: &GlobalSession| session.status == GlobalStatus::AsyncCommitting;
        let Some(session) = self.reload(&xid, eligible).await? else {
            return Ok(false);
        };
        self.inner.locks.release_global_session_lock(&session).await?;
        self.drive_commit(session).await?;
        Ok(true)
    }

    fn is_retry_rollbacking(&self, session: &GlobalSession) -> bool {
        match session.status {
            GlobalStatus::RollbackRetrying | GlobalStatus::TimeoutRollbackRetrying => true,
            GlobalStatus::Rollbacking | GlobalStatus::TimeoutRollbacking => self.is_orphaned(session),
            GlobalStatus::Rollbacked | GlobalStatus::TimeoutRollbacked => !session.has_branch(),
            _ => false,
        }
    }

    /// Drives retrying and orphaned rollbacks again.
    #[instrument(skip_all)]
    pub async fn handle_retry_rollbacking(&self) -> Result<usize> {
        let statuses = [
            GlobalStatus::RollbackRetrying,
            GlobalStatus::TimeoutRollbackRetrying,
            GlobalStatus::TimeoutRollbacking,
            GlobalStatus::Rollbacking,
            GlobalStatus::Rollbacked,
            GlobalStatus::TimeoutRollbacked,
        ];
        let xids = self.candidates(&statuses, |session| self.is_retry_rollbacking(session)).await?;
        Ok(self.handle_each(xids, |xid| self.retry_rollback(xid)).await)
    }

    #[instrument(skip(self))]
    async fn retry_rollback(&self, xid: String) -> Result<bool> {
        let Some(_latch) = self.inner.latches.try_lock(&xid) else {
            return Ok(false);
        };
        let Some(mut session) = self.reload(&xid, |session| self.is_retry_rollbacking(session)).await? else {
            return Ok(false);
        };
        if matches!(session.status, GlobalStatus::Rollbacked | GlobalStatus::TimeoutRollbacked) {
            self.end_session(&session).await?;
            return Ok(true);
        }
        let exhausted = self
            .inner
            .config
            .max_rollback_retry_timeout
            .is_some_and(|max| self.inner.clock.elapsed_since(session.begin_time) >= max);
        if exhausted {
            if !self.inner.config.rollback_retry_timeout_unlock {
                warn!("global transaction {xid} exhausted rollback retries, keep retrying with row locks held");
            } else {
                let status = match session.status.is_timeout_rollback() {
                    true => GlobalStatus::TimeoutRollbackRetryTimeout,
                    false => GlobalStatus::RollbackRetryTimeout,
                };
                if session.status == GlobalStatus::Rollbacking {
                    session.transit(GlobalStatus::RollbackRetrying, self.now())?;
                }
                self.inner.locks.release_global_session_lock(&session).await?;
                self.transit_and_persist(&mut session, status).await?;
                error!("global transaction {xid} exhausted rollback retries, row locks released, operator attention required");
                return Ok(true);
            }
        }
        self.drive_rollback(session).await?;
        Ok(true)
    }

    /// Asks participants to purge undo logs older than the retention.
    #[instrument(skip_all)]
    pub async fn undo_log_delete(&self) -> Result<usize> {
        let save_days = self.inner.config.undo_log_save_days;
        self.inner.remoting.purge_undo_logs(save_days).await?;
        debug!("purged undo logs older than {save_days} days");
        Ok(1)
    }
}

/// Runs coordinator scans periodically, each kind at most on one coordinator at a time.
#[derive_where(Debug)]
pub struct Scheduler {
    coordinator: Coordinator,
    #[derive_where(skip(Debug))]
    locker: Arc<dyn DistributedLocker>,
}

/// Stops all scan loops on drop.
#[derive(Debug)]
pub struct SchedulerHandle {
    _owner: DropOwner,
}

impl Scheduler {
    pub fn new(coordinator: Coordinator, locker: Arc<dyn DistributedLocker>) -> Self {
        Self { coordinator, locker }
    }

    /// Runs scan `kind` once if this coordinator wins its distributed lock.
    ///
    /// Returns `None` if another coordinator holds the lock.
    pub async fn run_once(&self, kind: ScanKind) -> Result<Option<usize>> {
        let config = self.coordinator.config();
        let owner = config.scheduler_lock_owner();
        let name = kind.lock_name();
        if !self.locker.try_acquire(name, owner, config.scheduler_lock_lease).await? {
            debug!("skip scan {kind:?} as lock {name} is held by others");
            return Ok(None);
        }
        let lease = config.scheduler_lock_lease;
        let result = select! {
            result = self.coordinator.scan(kind) => result,
            lost = self.keep_lock(name, owner, lease) => Err(lost.into()),
        };
        if let Err(err) = self.locker.release(name, owner).await {
            warn!("fail to release scheduler lock {name}: {err}");
        }
        result.map(Some)
    }

    /// Extends lock `name` every third of `lease`. Completes only when the lock is lost, so
    /// scans racing it are cut short before others could take over.
    async fn keep_lock(&self, name: &str, owner: &str, lease: Duration) -> anyhow::Error {
        let mut interval = tokio::time::interval((lease / 3).max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        let mut extended_at = Instant::now();
        loop {
            interval.tick().await;
            match self.locker.try_acquire(name, owner, lease).await {
                Ok(true) => extended_at = Instant::now(),
                Ok(false) => return anyhow!("scheduler lock {name} taken over by others"),
                Err(err) if extended_at.elapsed() >= lease => {
                    return anyhow!("scheduler lock {name} expired after failed extension: {err}")
                },
                Err(err) => warn!("fail to extend scheduler lock {name}: {err}"),
            }
        }
    }

    pub fn start(self) -> SchedulerHandle {
        let (owner, watcher) = utils::drop_watcher();
        let scheduler = Arc::new(self);
        for kind in ScanKind::ALL {
            tokio::spawn(scheduler.clone().serve(kind, watcher.clone()));
        }
        SchedulerHandle { _owner: owner }
    }

    async fn serve(self: Arc<Self>, kind: ScanKind, mut watcher: DropWatcher) {
        let period = kind.period(self.coordinator.config());
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=millis_of(period) / 10));
        let mut interval = tokio::time::interval_at(Instant::now() + jitter, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                biased;
                _ = watcher.dropped() => break,
                _ = interval.tick() => {
                    match self.run_once(kind).await {
                        Ok(Some(0)) | Ok(None) => {},
                        Ok(Some(n)) => debug!("scan {kind:?} handled {n} global transactions"),
                        Err(err) => warn!("scan {kind:?} failed: {err}"),
                    }
                },
            }
        }
        debug!("scan {kind:?} stopped");
    }
}
