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
use std::time::Duration;

use thiserror::Error;

use super::branch::{BranchHandling, BranchSession};
use super::status::GlobalStatus;
use crate::clock::{millis_of, Millis};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("illegal global status transition from {from} to {to}")]
pub struct IllegalTransition {
    pub from: GlobalStatus,
    pub to: GlobalStatus,
}

/// One distributed transaction and its branches in registration order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalSession {
    pub xid: String,
    pub transaction_id: u64,
    pub application_id: String,
    pub transaction_service_group: String,
    pub transaction_name: String,
    pub status: GlobalStatus,
    pub timeout: Duration,
    pub begin_time: Millis,
    pub gmt_updated: Millis,
    pub application_data: String,
    branches: Vec<BranchSession>,
}

impl GlobalSession {
    pub fn new(
        xid: String,
        transaction_id: u64,
        application_id: impl Into<String>,
        transaction_service_group: impl Into<String>,
        transaction_name: impl Into<String>,
        timeout: Duration,
        now: Millis,
    ) -> Self {
        Self {
            xid,
            transaction_id,
            application_id: application_id.into(),
            transaction_service_group: transaction_service_group.into(),
            transaction_name: transaction_name.into(),
            status: GlobalStatus::Begin,
            timeout,
            begin_time: now,
            gmt_updated: now,
            application_data: String::new(),
            branches: Vec::new(),
        }
    }

    pub fn with_branches(self, branches: Vec<BranchSession>) -> Self {
        Self { branches, ..self }
    }

    pub fn branches(&self) -> &[BranchSession] {
        &self.branches
    }

    pub(crate) fn branches_mut(&mut self) -> &mut Vec<BranchSession> {
        &mut self.branches
    }

    pub fn has_branch(&self) -> bool {
        !self.branches.is_empty()
    }

    pub fn branch_ids(&self) -> Vec<u64> {
        self.branches.iter().map(|branch| branch.branch_id).collect()
    }

    pub fn find_branch(&self, branch_id: u64) -> Option<&BranchSession> {
        self.branches.iter().find(|branch| branch.branch_id == branch_id)
    }

    pub fn find_branch_mut(&mut self, branch_id: u64) -> Option<&mut BranchSession> {
        self.branches.iter_mut().find(|branch| branch.branch_id == branch_id)
    }

    pub fn add_branch(&mut self, branch: BranchSession) {
        self.branches.push(branch);
    }

    pub fn remove_branch(&mut self, branch_id: u64) -> Option<BranchSession> {
        let index = self.branches.iter().position(|branch| branch.branch_id == branch_id)?;
        Some(self.branches.remove(index))
    }

    pub fn deadline(&self) -> Millis {
        self.begin_time.saturating_add(millis_of(self.timeout))
    }

    pub fn is_timed_out(&self, now: Millis) -> bool {
        now >= self.deadline()
    }

    /// Whether every branch may finish phase two commit after the outcome is reported.
    pub fn can_be_committed_async(&self) -> bool {
        self.branches.iter().all(|branch| branch.branch_type.commits_async())
    }

    pub fn reports_global_outcome(&self) -> bool {
        self.branches.iter().all(|branch| branch.branch_type.reports_global_outcome())
    }

    pub fn transit(&mut self, to: GlobalStatus, now: Millis) -> Result<(), IllegalTransition> {
        if !self.status.can_transit_to(to) {
            return Err(IllegalTransition { from: self.status, to });
        }
        self.status = to;
        self.gmt_updated = now;
        Ok(())
    }
}

impl Display for GlobalSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, {} branches)", self.xid, self.status, self.branches.len())
    }
}
