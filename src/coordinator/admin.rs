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

//! Operator facing operations. Each one is only valid for sessions in specific statuses and
//! fails with [CoordinatorError::InvalidStatus] otherwise.

use tracing::{info, instrument, warn};

use super::{Coordinator, CoordinatorError, Result};
use crate::session::{BranchSession, BranchStatus, GlobalStatus};

fn is_deletable(status: GlobalStatus) -> bool {
    status.is_one_of(GlobalStatus::FAIL_COMMIT)
        || status.is_one_of(GlobalStatus::FAIL_ROLLBACK)
        || status.is_one_of(GlobalStatus::RETRY_COMMIT)
        || status.is_one_of(GlobalStatus::RETRY_ROLLBACK)
        || status.is_one_of(GlobalStatus::FINISH)
        || status.is_one_of(GlobalStatus::STOP)
        || status == GlobalStatus::Deleting
}

fn is_branch_deletable(status: GlobalStatus) -> bool {
    status.is_one_of(GlobalStatus::FAIL_COMMIT)
        || status.is_one_of(GlobalStatus::FAIL_ROLLBACK)
        || status.is_one_of(GlobalStatus::RETRY_COMMIT)
        || status.is_one_of(GlobalStatus::RETRY_ROLLBACK)
        || status.is_one_of(GlobalStatus::STOP)
        || status == GlobalStatus::Deleting
}

impl Coordinator {
    /// Deletes branch data at its participant and releases its row locks.
    ///
    /// Returns whether the branch may be removed from its session. Branches failed in phase
    /// one have nothing to delete remotely.
    pub(crate) async fn do_branch_delete(&self, branch: &BranchSession) -> Result<bool> {
        if branch.status != BranchStatus::PhaseOneFailed {
            let timeout = self.inner.config.branch_timeout;
            let deleted = match tokio::time::timeout(timeout, self.inner.remoting.branch_delete(branch, timeout)).await
            {
                Ok(Ok(deleted)) => deleted,
                Ok(Err(err)) => {
                    warn!("fail to delete branch {branch}: {err}");
                    false
                },
                Err(_) => {
                    warn!("fail to delete branch {branch}: timeout after {timeout:?}");
                    false
                },
            };
            if !deleted {
                return Ok(false);
            }
        }
        if let Err(err) = self.inner.locks.release_lock(branch).await {
            warn!("fail to unlock rows of deleted branch {branch}: {err}");
            return Ok(false);
        }
        Ok(true)
    }

    #[instrument(skip(self))]
    pub async fn delete_global_session(&self, xid: &str) -> Result<()> {
        let _latch = self.inner.latches.lock(xid).await;
        let mut session = self.load(xid).await?;
        if !is_deletable(session.status) {
            return Err(CoordinatorError::invalid_status(xid, session.status, "delete global session"));
        }
        if session.status != GlobalStatus::Deleting {
            self.transit_and_persist(&mut session, GlobalStatus::Deleting).await?;
        }
        for branch in session.branches().to_vec() {
            if !self.do_branch_delete(&branch).await? {
                return Err(CoordinatorError::BranchDeleteFailed { xid: xid.to_string(), branch_id: branch.branch_id });
            }
            self.remove_branch(&mut session, &branch, false).await?;
        }
        self.end_session(&session).await?;
        info!("global transaction {xid} deleted");
        Ok(())
    }

    /// Drops session `xid` and its row locks regardless of its status or its participants.
    #[instrument(skip(self))]
    pub async fn force_delete_global_session(&self, xid: &str) -> Result<()> {
        let _latch = self.inner.latches.lock(xid).await;
        let mut session = self.load(xid).await?;
        if session.status != GlobalStatus::Deleting {
            self.transit_and_persist(&mut session, GlobalStatus::Deleting).await?;
        }
        self.end_session(&session).await?;
        warn!("global transaction {xid} force deleted with {} branches", session.branches().len());
        Ok(())
    }

    /// Pauses retrying of session `xid` until [Coordinator::start_global_retry].
    #[instrument(skip(self))]
    pub async fn stop_global_retry(&self, xid: &str) -> Result<GlobalStatus> {
        let _latch = self.inner.latches.lock(xid).await;
        let mut session = self.load(xid).await?;
        let to = match session.status {
            GlobalStatus::Committing | GlobalStatus::CommitRetrying => GlobalStatus::StopCommitOrCommitRetry,
            status if status == GlobalStatus::Rollbacking || status.is_one_of(GlobalStatus::RETRY_ROLLBACK) => {
                GlobalStatus::StopRollbackOrRollbackRetry
            },
            status => return Err(CoordinatorError::invalid_status(xid, status, "stop global retry")),
        };
        self.transit_and_persist(&mut session, to).await?;
        info!("global transaction {xid} stopped retrying");
        Ok(to)
    }

    #[instrument(skip(self))]
    pub async fn start_global_retry(&self, xid: &str) -> Result<GlobalStatus> {
        let _latch = self.inner.latches.lock(xid).await;
        let mut session = self.load(xid).await?;
        let to = match session.status {
            GlobalStatus::StopCommitOrCommitRetry => GlobalStatus::CommitRetrying,
            GlobalStatus::StopRollbackOrRollbackRetry => GlobalStatus::RollbackRetrying,
            status => return Err(CoordinatorError::invalid_status(xid, status, "start global retry")),
        };
        self.transit_and_persist(&mut session, to).await?;
        info!("global transaction {xid} resumed retrying");
        Ok(to)
    }

    /// Drives session `xid` in its decided direction right away. Returns whether it completed.
    #[instrument(skip(self))]
    pub async fn send_commit_or_rollback(&self, xid: &str) -> Result<bool> {
        let _latch = self.inner.latches.lock(xid).await;
        let mut session = self.load(xid).await?;
        match session.status {
            status if status == GlobalStatus::Committing || status.is_one_of(GlobalStatus::RETRY_COMMIT) => {
                let status = self.drive_commit(session).await?;
                Ok(status == GlobalStatus::Committed)
            },
            GlobalStatus::StopCommitOrCommitRetry => {
                self.transit_and_persist(&mut session, GlobalStatus::CommitRetrying).await?;
                let status = self.drive_commit(session).await?;
                Ok(status == GlobalStatus::Committed)
            },
            status if status == GlobalStatus::Rollbacking || status.is_one_of(GlobalStatus::RETRY_ROLLBACK) => {
                let status = self.drive_rollback(session).await?;
                Ok(matches!(status, GlobalStatus::Rollbacked | GlobalStatus::TimeoutRollbacked))
            },
            GlobalStatus::StopRollbackOrRollbackRetry => {
                self.transit_and_persist(&mut session, GlobalStatus::RollbackRetrying).await?;
                let status = self.drive_rollback(session).await?;
                Ok(matches!(status, GlobalStatus::Rollbacked | GlobalStatus::TimeoutRollbacked))
            },
            status => Err(CoordinatorError::invalid_status(xid, status, "send commit or rollback")),
        }
    }

    /// Moves failed session `xid` back to retrying.
    #[instrument(skip(self))]
    pub async fn change_global_status(&self, xid: &str) -> Result<GlobalStatus> {
        let _latch = self.inner.latches.lock(xid).await;
        let mut session = self.load(xid).await?;
        let to = if session.status.is_one_of(GlobalStatus::FAIL_COMMIT) {
            GlobalStatus::CommitRetrying
        } else if session.status.is_one_of(GlobalStatus::FAIL_ROLLBACK) {
            GlobalStatus::RollbackRetrying
        } else {
            return Err(CoordinatorError::invalid_status(xid, session.status, "change global status"));
        };
        self.transit_and_persist(&mut session, to).await?;
        info!("global transaction {xid} changed to {to}");
        Ok(to)
    }

    #[instrument(skip(self))]
    pub async fn delete_branch(&self, xid: &str, branch_id: u64) -> Result<()> {
        let _latch = self.inner.latches.lock(xid).await;
        let mut session = self.load(xid).await?;
        if !is_branch_deletable(session.status) {
            return Err(CoordinatorError::invalid_status(xid, session.status, "delete branch"));
        }
        let Some(branch) = session.find_branch(branch_id).cloned() else {
            return Err(CoordinatorError::branch_not_found(xid, branch_id));
        };
        if !self.do_branch_delete(&branch).await? {
            return Err(CoordinatorError::BranchDeleteFailed { xid: xid.to_string(), branch_id });
        }
        self.remove_branch(&mut session, &branch, false).await?;
        info!("branch {branch} deleted");
        Ok(())
    }

    /// Drops branch `branch_id` and its row locks without contacting its participant.
    #[instrument(skip(self))]
    pub async fn force_delete_branch(&self, xid: &str, branch_id: u64) -> Result<()> {
        let _latch = self.inner.latches.lock(xid).await;
        let mut session = self.load(xid).await?;
        let Some(branch) = session.find_branch(branch_id).cloned() else {
            return Err(CoordinatorError::branch_not_found(xid, branch_id));
        };
        self.remove_branch(&mut session, &branch, true).await?;
        warn!("branch {branch} force deleted");
        Ok(())
    }
}
