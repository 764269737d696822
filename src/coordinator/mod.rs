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

//! Global transaction coordinator.
//!
//! Every operation re-reads its session from the [SessionStore], mutates a private copy and
//! writes it back before reporting success. The store is the only place session state lives,
//! so a coordinator restarting over the same store resumes exactly where the old one stopped.

mod admin;
mod config;
mod driver;
mod error;
mod latch;
mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use derive_where::derive_where;
use static_assertions::assert_impl_all;
use tracing::{debug, info, instrument, warn};

pub use self::config::CoordinatorConfig;
pub use self::error::{CoordinatorError, Result};
use self::latch::XidLatches;
pub use self::scheduler::{ScanKind, Scheduler, SchedulerHandle};
use crate::clock::Clock;
use crate::id::{format_xid, IdGenerator};
use crate::lock::{LockManager, LockStore, MemoryLockStore};
use crate::remoting::BranchRemoting;
use crate::session::{BranchHandling, BranchSession, BranchStatus, BranchType, GlobalSession, GlobalStatus};
use crate::store::{MemorySessionStore, SessionStore, StoreError};

/// Collaborators a coordinator drives.
#[derive_where(Debug)]
pub struct CoordinatorEnv {
    clock: Clock,
    #[derive_where(skip(Debug))]
    store: Arc<dyn SessionStore>,
    #[derive_where(skip(Debug))]
    lock_store: Arc<dyn LockStore>,
    #[derive_where(skip(Debug))]
    remoting: Arc<dyn BranchRemoting>,
}

impl CoordinatorEnv {
    pub fn new(
        store: Arc<dyn SessionStore>,
        lock_store: Arc<dyn LockStore>,
        remoting: Arc<dyn BranchRemoting>,
    ) -> Self {
        Self { clock: Clock::new(), store, lock_store, remoting }
    }

    /// Process local stores, sessions and locks are lost with the process.
    pub fn memory(remoting: Arc<dyn BranchRemoting>) -> Self {
        Self::new(Arc::new(MemorySessionStore::new()), Arc::new(MemoryLockStore::new()), remoting)
    }

    pub fn with_clock(self, clock: Clock) -> Self {
        Self { clock, ..self }
    }
}

/// Counts of a recovery pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub sessions: usize,
    pub branches: usize,
    pub lock_conflicts: usize,
}

#[derive_where(Debug)]
struct CoordinatorInner {
    config: CoordinatorConfig,
    clock: Clock,
    ids: IdGenerator,
    #[derive_where(skip(Debug))]
    store: Arc<dyn SessionStore>,
    #[derive_where(skip(Debug))]
    locks: LockManager,
    #[derive_where(skip(Debug))]
    remoting: Arc<dyn BranchRemoting>,
    #[derive_where(skip(Debug))]
    latches: XidLatches,
}

#[derive(Clone, Debug)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

assert_impl_all!(Coordinator: Send, Sync);

impl Coordinator {
    pub fn new(config: CoordinatorConfig, env: CoordinatorEnv) -> Result<Self> {
        let ids = IdGenerator::new(config.node_id, &env.clock)?;
        let inner = CoordinatorInner {
            config,
            clock: env.clock,
            ids,
            store: env.store,
            locks: LockManager::new(env.lock_store),
            remoting: env.remoting,
            latches: XidLatches::new(),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.inner.store
    }

    fn now(&self) -> u64 {
        self.inner.clock.now()
    }

    async fn load(&self, xid: &str) -> Result<GlobalSession> {
        match self.inner.store.find_global_session(xid).await? {
            None => Err(CoordinatorError::global_not_found(xid)),
            Some(session) => Ok(session),
        }
    }

    /// Starts a global transaction and returns its xid.
    #[instrument(skip(self))]
    pub async fn begin(
        &self,
        application_id: &str,
        transaction_service_group: &str,
        transaction_name: &str,
        timeout: Duration,
    ) -> Result<String> {
        if timeout.is_zero() {
            return Err(CoordinatorError::invalid_argument("global transaction timeout must be positive"));
        }
        let transaction_id = self.inner.ids.next_id();
        let xid = format_xid(&self.inner.config.address, transaction_id);
        let session = GlobalSession::new(
            xid.clone(),
            transaction_id,
            application_id,
            transaction_service_group,
            transaction_name,
            timeout,
            self.now(),
        );
        if let Err(err) = self.inner.store.add_global_session(&session).await {
            return Err(CoordinatorError::BeginFailed { source: err });
        }
        info!("begin global transaction {xid}");
        Ok(xid)
    }

    /// Enlists a branch into global transaction `xid` and returns its branch id.
    ///
    /// Branches holding row locks lock all rows of `lock_key` or none of them.
    #[instrument(skip(self, application_data))]
    pub async fn branch_register(
        &self,
        branch_type: BranchType,
        resource_id: &str,
        client_id: &str,
        xid: &str,
        application_data: &str,
        lock_key: &str,
    ) -> Result<u64> {
        let _latch = self.inner.latches.lock(xid).await;
        let session = self.load(xid).await?;
        match session.status {
            GlobalStatus::Begin => {},
            GlobalStatus::Committing | GlobalStatus::Rollbacking => {
                let registered = session
                    .branches()
                    .iter()
                    .find(|branch| branch.is_same_registration(branch_type, resource_id, client_id, lock_key));
                if let Some(branch) = registered {
                    debug!("branch {branch} registered again");
                    return Ok(branch.branch_id);
                }
                return Err(CoordinatorError::invalid_status(xid, session.status, "branch register"));
            },
            status => return Err(CoordinatorError::invalid_status(xid, status, "branch register")),
        }
        let branch = BranchSession {
            xid: session.xid.clone(),
            transaction_id: session.transaction_id,
            branch_id: self.inner.ids.next_id(),
            resource_group_id: session.transaction_service_group.clone(),
            resource_id: resource_id.to_string(),
            client_id: client_id.to_string(),
            branch_type,
            status: BranchStatus::Registered,
            lock_key: lock_key.to_string(),
            application_data: application_data.to_string(),
            begin_time: self.now(),
        };
        if !self.inner.locks.acquire_lock(&branch).await? {
            return Err(CoordinatorError::LockConflict { xid: xid.to_string(), lock_key: lock_key.to_string() });
        }
        if let Err(err) = self.inner.store.add_branch_session(&branch).await {
            if let Err(unlock_err) = self.inner.locks.release_lock(&branch).await {
                warn!("fail to unlock rows of unregistered branch {branch}: {unlock_err}");
            }
            return match err {
                StoreError::SessionNotActive { status, .. } => {
                    Err(CoordinatorError::invalid_status(xid, status, "branch register"))
                },
                err => Err(err.into()),
            };
        }
        info!("register branch {branch}");
        Ok(branch.branch_id)
    }

    /// Records a status reported by the branch participant.
    #[instrument(skip(self, application_data))]
    pub async fn branch_report(
        &self,
        xid: &str,
        branch_id: u64,
        status: BranchStatus,
        application_data: Option<&str>,
    ) -> Result<()> {
        let _latch = self.inner.latches.lock(xid).await;
        let session = self.load(xid).await?;
        let Some(branch) = session.find_branch(branch_id) else {
            return Err(CoordinatorError::branch_not_found(xid, branch_id));
        };
        if !branch.branch_type.accepts_report(status) {
            return Err(CoordinatorError::invalid_argument(format!(
                "{} branch {branch_id} can not report status {status}",
                branch.branch_type
            )));
        }
        let mut branch = branch.clone();
        branch.status = status;
        if let Some(application_data) = application_data {
            branch.application_data = application_data.to_string();
        }
        self.inner.store.update_branch_session(&branch).await?;
        debug!("branch {branch} reported {status}");
        Ok(())
    }

    /// Commits global transaction `xid`.
    ///
    /// Repeated calls return current commit status without driving branches again. Unknown
    /// xids are treated as finished.
    #[instrument(skip(self))]
    pub async fn global_commit(&self, xid: &str) -> Result<GlobalStatus> {
        let _latch = self.inner.latches.lock(xid).await;
        let Some(mut session) = self.inner.store.find_global_session(xid).await? else {
            return Ok(GlobalStatus::Finished);
        };
        match session.status {
            GlobalStatus::Begin => {},
            GlobalStatus::AsyncCommitting => return Ok(GlobalStatus::Committed),
            status if status.is_commit_bound() || status.is_commit_outcome() => return Ok(status),
            status => return Err(CoordinatorError::invalid_status(xid, status, "commit")),
        }
        if self.inner.config.async_commit && session.has_branch() && session.can_be_committed_async() {
            self.transit_and_persist(&mut session, GlobalStatus::AsyncCommitting).await?;
            // Asynchronous committing scan releases them again on failure.
            if let Err(err) = self.inner.locks.release_global_session_lock(&session).await {
                warn!("fail to unlock rows of async committing {session}: {err}");
            }
            info!("global transaction {xid} committed, branches will be committed asynchronously");
            return Ok(GlobalStatus::Committed);
        }
        self.transit_and_persist(&mut session, GlobalStatus::Committing).await?;
        self.drive_commit(session).await
    }

    /// Rolls back global transaction `xid`.
    ///
    /// Repeated calls return current rollback status without driving branches again. Unknown
    /// xids are treated as finished.
    #[instrument(skip(self))]
    pub async fn global_rollback(&self, xid: &str) -> Result<GlobalStatus> {
        let _latch = self.inner.latches.lock(xid).await;
        let Some(mut session) = self.inner.store.find_global_session(xid).await? else {
            return Ok(GlobalStatus::Finished);
        };
        match session.status {
            GlobalStatus::Begin => {},
            status if status.is_rollback_bound() || status.is_rollback_outcome() => return Ok(status),
            status => return Err(CoordinatorError::invalid_status(xid, status, "rollback")),
        }
        self.transit_and_persist(&mut session, GlobalStatus::Rollbacking).await?;
        self.drive_rollback(session).await
    }

    pub async fn get_status(&self, xid: &str) -> Result<GlobalStatus> {
        let session = self.inner.store.find_global_session(xid).await?;
        Ok(session.map(|session| session.status).unwrap_or(GlobalStatus::Finished))
    }

    /// Accepts global outcome from participants of transactions driving themselves.
    #[instrument(skip(self))]
    pub async fn global_report(&self, xid: &str, status: GlobalStatus) -> Result<GlobalStatus> {
        let _latch = self.inner.latches.lock(xid).await;
        let Some(mut session) = self.inner.store.find_global_session(xid).await? else {
            return Ok(GlobalStatus::Finished);
        };
        if !session.reports_global_outcome() {
            return Err(CoordinatorError::invalid_status(xid, session.status, "global report"));
        }
        match status {
            GlobalStatus::Committed | GlobalStatus::Rollbacked | GlobalStatus::TimeoutRollbacked => {
                self.inner.locks.release_global_session_lock(&session).await?;
                self.inner.store.remove_global_session(xid).await?;
                info!("global transaction {xid} reported {status}");
            },
            GlobalStatus::Committing
            | GlobalStatus::CommitRetrying
            | GlobalStatus::CommitFailed
            | GlobalStatus::Rollbacking
            | GlobalStatus::RollbackRetrying
            | GlobalStatus::RollbackFailed => {
                // Reporting participants own the outcome, so no state graph applies.
                session.status = status;
                session.gmt_updated = self.now();
                self.inner.store.update_global_session(&session).await?;
                debug!("global transaction {xid} reported {status}");
            },
            _ => return Err(CoordinatorError::invalid_argument(format!("can not report global status {status}"))),
        }
        Ok(status)
    }

    /// Whether rows of `lock_key` are free or already held by `xid`.
    pub async fn lock_query(
        &self,
        branch_type: BranchType,
        resource_id: &str,
        xid: &str,
        lock_key: &str,
    ) -> Result<bool> {
        if !branch_type.holds_row_locks() {
            return Err(CoordinatorError::invalid_argument(format!("{branch_type} branches hold no row locks")));
        }
        Ok(self.inner.locks.is_lockable(xid, resource_id, lock_key).await?)
    }

    /// Rehydrates row locks of every stored session into the lock store.
    ///
    /// Driving sessions forward is left to scheduler scans.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let sessions = self.inner.store.find_global_sessions(&GlobalStatus::ALL).await?;
        let mut report = RecoveryReport::default();
        for session in sessions {
            report.sessions += 1;
            report.branches += session.branches().len();
            if !session.status.holds_row_locks() {
                continue;
            }
            for branch in session.branches() {
                if !self.inner.locks.acquire_lock(branch).await? {
                    warn!("fail to restore row locks of branch {branch}: held by others");
                    report.lock_conflicts += 1;
                }
            }
        }
        info!(
            "recovered {} global sessions with {} branches, {} lock conflicts",
            report.sessions, report.branches, report.lock_conflicts
        );
        Ok(report)
    }

    async fn remove_branch(&self, session: &mut GlobalSession, branch: &BranchSession, unlock: bool) -> Result<()> {
        if unlock {
            self.inner.locks.release_lock(branch).await?;
        }
        self.inner.store.remove_branch_session(&session.xid, branch.branch_id).await?;
        session.remove_branch(branch.branch_id);
        Ok(())
    }

    /// Persists `session` in status `to` and adopts branches as stored.
    ///
    /// Branches registered through other coordinators before the status left `Begin` are
    /// picked up here. Later ones are refused by the store.
    async fn transit_and_persist(&self, session: &mut GlobalSession, to: GlobalStatus) -> Result<()> {
        session.transit(to, self.now())?;
        *session = self.inner.store.update_global_session(session).await?;
        Ok(())
    }

    async fn end_session(&self, session: &GlobalSession) -> Result<()> {
        self.inner.locks.release_global_session_lock(session).await?;
        self.inner.store.remove_global_session(&session.xid).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
