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

use std::fmt::{self, Display, Formatter};

use tracing::{debug, error, info, instrument, warn};

use super::{Coordinator, Result};
use crate::remoting::RemotingError;
use crate::session::{BranchHandling, BranchSession, BranchStatus, GlobalSession, GlobalStatus, PhaseTwoOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Commit,
    Rollback,
}

impl Direction {
    fn outcome(self, branch: &BranchSession, status: BranchStatus) -> PhaseTwoOutcome {
        match self {
            Direction::Commit => branch.branch_type.commit_outcome(status),
            Direction::Rollback => branch.branch_type.rollback_outcome(status),
        }
    }

    fn retrying_status(self, current: GlobalStatus) -> GlobalStatus {
        match self {
            Direction::Commit if current == GlobalStatus::AsyncCommitting => GlobalStatus::AsyncCommitting,
            Direction::Commit => GlobalStatus::CommitRetrying,
            Direction::Rollback if current.is_timeout_rollback() => GlobalStatus::TimeoutRollbackRetrying,
            Direction::Rollback => GlobalStatus::RollbackRetrying,
        }
    }

    fn failed_status(self) -> GlobalStatus {
        match self {
            Direction::Commit => GlobalStatus::CommitFailed,
            Direction::Rollback => GlobalStatus::RollbackFailed,
        }
    }

    fn completed_status(self, current: GlobalStatus) -> GlobalStatus {
        match self {
            Direction::Commit => GlobalStatus::Committed,
            Direction::Rollback if current.is_timeout_rollback() => GlobalStatus::TimeoutRollbacked,
            Direction::Rollback => GlobalStatus::Rollbacked,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Commit => f.write_str("commit"),
            Direction::Rollback => f.write_str("rollback"),
        }
    }
}

impl Coordinator {
    /// Drives phase two commit of branches in registration order.
    ///
    /// Caller must hold the xid latch and have persisted `session` in a commit bound status.
    pub(crate) async fn drive_commit(&self, session: GlobalSession) -> Result<GlobalStatus> {
        self.drive(session, Direction::Commit).await
    }

    /// Drives phase two rollback of branches in reverse registration order.
    ///
    /// Caller must hold the xid latch and have persisted `session` in a rollback bound status.
    pub(crate) async fn drive_rollback(&self, session: GlobalSession) -> Result<GlobalStatus> {
        self.drive(session, Direction::Rollback).await
    }

    async fn send_phase_two(&self, direction: Direction, branch: &BranchSession) -> Result<BranchStatus, RemotingError> {
        let timeout = self.inner.config.branch_timeout;
        let call = async {
            match direction {
                Direction::Commit => self.inner.remoting.branch_commit(branch, timeout).await,
                Direction::Rollback => self.inner.remoting.branch_rollback(branch, timeout).await,
            }
        };
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemotingError::timeout(branch, timeout)),
        }
    }

    #[instrument(skip_all, fields(xid = %session.xid, status = %session.status, direction = %direction))]
    async fn drive(&self, mut session: GlobalSession, direction: Direction) -> Result<GlobalStatus> {
        let mut branch_ids = session.branch_ids();
        if direction == Direction::Rollback {
            branch_ids.reverse();
        }
        for branch_id in branch_ids {
            let Some(branch) = session.find_branch(branch_id).cloned() else {
                continue;
            };
            if branch.branch_type.skips_phase_two(branch.status) {
                debug!("skip phase two {direction} of branch {branch}");
                self.remove_branch(&mut session, &branch, true).await?;
                continue;
            }
            let (outcome, reported) = match self.send_phase_two(direction, &branch).await {
                Ok(status) => (direction.outcome(&branch, status), Some(status)),
                Err(err) => {
                    warn!("fail to {direction} branch {branch}: {err}");
                    (PhaseTwoOutcome::Retryable, None)
                },
            };
            match outcome {
                PhaseTwoOutcome::Done => self.remove_branch(&mut session, &branch, true).await?,
                PhaseTwoOutcome::Retryable => {
                    let status = direction.retrying_status(session.status);
                    return self.suspend(session, branch, reported, status).await;
                },
                PhaseTwoOutcome::Unretryable => {
                    error!("branch {branch} failed {direction} unretryably with {reported:?}, operator attention required");
                    return self.suspend(session, branch, reported, direction.failed_status()).await;
                },
            }
        }
        let status = direction.completed_status(session.status);
        session.transit(status, self.now())?;
        self.inner.store.update_global_session(&session).await?;
        self.end_session(&session).await?;
        info!("global transaction {} {status}", session.xid);
        Ok(status)
    }

    /// Records where driving stopped so later drives resume from `branch`.
    async fn suspend(
        &self,
        mut session: GlobalSession,
        mut branch: BranchSession,
        reported: Option<BranchStatus>,
        status: GlobalStatus,
    ) -> Result<GlobalStatus> {
        if let Some(reported) = reported.filter(|reported| *reported != branch.status) {
            branch.status = reported;
            self.inner.store.update_branch_session(&branch).await?;
        }
        session.transit(status, self.now())?;
        self.inner.store.update_global_session(&session).await?;
        debug!("suspend global transaction {} in {status} at branch {}", session.xid, branch.branch_id);
        Ok(status)
    }
}
