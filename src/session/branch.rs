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

use enum_dispatch::enum_dispatch;

use super::status::BranchStatus;
use crate::clock::Millis;

/// How the coordinator should treat a participant's phase two answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseTwoOutcome {
    Done,
    Retryable,
    Unretryable,
}

/// Per branch-type behavior the coordinator depends on.
#[enum_dispatch]
pub trait BranchHandling {
    fn code(&self) -> i32;

    fn name(&self) -> &'static str;

    /// Whether branches of this type take global row locks at registration.
    fn holds_row_locks(&self) -> bool {
        false
    }

    /// Whether phase two commit may complete after the global outcome was reported.
    fn commits_async(&self) -> bool {
        false
    }

    /// Whether participants drive the global outcome themselves through global report.
    fn reports_global_outcome(&self) -> bool {
        false
    }

    /// Whether a branch in given phase one status needs no phase two request.
    fn skips_phase_two(&self, status: BranchStatus) -> bool {
        status == BranchStatus::PhaseOneFailed
    }

    fn accepts_report(&self, status: BranchStatus) -> bool {
        !matches!(status, BranchStatus::Unknown | BranchStatus::Registered)
    }

    fn commit_outcome(&self, status: BranchStatus) -> PhaseTwoOutcome {
        match status {
            BranchStatus::PhaseTwoCommitted => PhaseTwoOutcome::Done,
            BranchStatus::PhaseTwoCommitFailed | BranchStatus::PhaseOneFailed => PhaseTwoOutcome::Unretryable,
            _ => PhaseTwoOutcome::Retryable,
        }
    }

    fn rollback_outcome(&self, status: BranchStatus) -> PhaseTwoOutcome {
        match status {
            BranchStatus::PhaseTwoRollbacked => PhaseTwoOutcome::Done,
            BranchStatus::PhaseTwoRollbackFailed | BranchStatus::PhaseTwoRollbackFailedUnretryable => {
                PhaseTwoOutcome::Unretryable
            },
            _ => PhaseTwoOutcome::Retryable,
        }
    }
}

/// Automatic transaction: coordinator held row locks plus participant side undo logs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct At;

/// Try-confirm-cancel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Tcc;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Saga;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Xa;

impl BranchHandling for At {
    fn code(&self) -> i32 {
        0
    }

    fn name(&self) -> &'static str {
        "AT"
    }

    fn holds_row_locks(&self) -> bool {
        true
    }

    fn commits_async(&self) -> bool {
        true
    }
}

impl BranchHandling for Tcc {
    fn code(&self) -> i32 {
        1
    }

    fn name(&self) -> &'static str {
        "TCC"
    }

    // Cancel must run even if try failed, participants guard against empty rollback.
    fn skips_phase_two(&self, _status: BranchStatus) -> bool {
        false
    }
}

impl BranchHandling for Saga {
    fn code(&self) -> i32 {
        2
    }

    fn name(&self) -> &'static str {
        "SAGA"
    }

    fn reports_global_outcome(&self) -> bool {
        true
    }

    fn rollback_outcome(&self, status: BranchStatus) -> PhaseTwoOutcome {
        match status {
            BranchStatus::PhaseTwoRollbacked => PhaseTwoOutcome::Done,
            BranchStatus::PhaseTwoRollbackFailedUnretryable => PhaseTwoOutcome::Unretryable,
            // Compensation failures are retried until the state machine gives up.
            _ => PhaseTwoOutcome::Retryable,
        }
    }
}

impl BranchHandling for Xa {
    fn code(&self) -> i32 {
        3
    }

    fn name(&self) -> &'static str {
        "XA"
    }

    // Phase two of xa branches is decided by the coordinator, never reported.
    fn accepts_report(&self, status: BranchStatus) -> bool {
        status.is_phase_one() && status != BranchStatus::Registered
    }
}

#[enum_dispatch(BranchHandling)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BranchType {
    At,
    Tcc,
    Saga,
    Xa,
}

impl BranchType {
    pub const AT: BranchType = BranchType::At(At);
    pub const TCC: BranchType = BranchType::Tcc(Tcc);
    pub const SAGA: BranchType = BranchType::Saga(Saga);
    pub const XA: BranchType = BranchType::Xa(Xa);

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::AT),
            1 => Some(Self::TCC),
            2 => Some(Self::SAGA),
            3 => Some(Self::XA),
            _ => None,
        }
    }
}

impl Display for BranchType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One participant enlisted in a global transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchSession {
    pub xid: String,
    pub transaction_id: u64,
    pub branch_id: u64,
    pub resource_group_id: String,
    pub resource_id: String,
    pub client_id: String,
    pub branch_type: BranchType,
    pub status: BranchStatus,
    pub lock_key: String,
    pub application_data: String,
    pub begin_time: Millis,
}

impl BranchSession {
    /// Whether a repeated registration request describes this branch.
    pub fn is_same_registration(&self, branch_type: BranchType, resource_id: &str, client_id: &str, lock_key: &str) -> bool {
        self.branch_type == branch_type
            && self.resource_id == resource_id
            && self.client_id == client_id
            && self.lock_key == lock_key
    }

    pub fn holds_row_locks(&self) -> bool {
        self.branch_type.holds_row_locks() && !self.lock_key.is_empty()
    }
}

impl Display for BranchSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}({}, {})", self.xid, self.branch_id, self.branch_type, self.resource_id)
    }
}
