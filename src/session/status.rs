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

/// Status of a global transaction.
///
/// Numeric codes are stable and persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum GlobalStatus {
    Unknown = 0,
    Begin = 1,
    Committing = 2,
    CommitRetrying = 3,
    Rollbacking = 4,
    RollbackRetrying = 5,
    TimeoutRollbacking = 6,
    TimeoutRollbackRetrying = 7,
    AsyncCommitting = 8,
    Committed = 9,
    CommitFailed = 10,
    Rollbacked = 11,
    RollbackFailed = 12,
    TimeoutRollbacked = 13,
    TimeoutRollbackRetryTimeout = 14,
    Finished = 15,
    CommitRetryTimeout = 16,
    RollbackRetryTimeout = 17,
    Deleting = 18,
    StopCommitOrCommitRetry = 19,
    StopRollbackOrRollbackRetry = 20,
}

use GlobalStatus::*;

impl GlobalStatus {
    pub const RETRY_COMMIT: &'static [GlobalStatus] = &[CommitRetrying];
    pub const RETRY_ROLLBACK: &'static [GlobalStatus] =
        &[RollbackRetrying, TimeoutRollbackRetrying, TimeoutRollbacking];
    pub const COMMIT_ING: &'static [GlobalStatus] = &[CommitRetrying, Committing];
    pub const ROLLBACK_ING: &'static [GlobalStatus] =
        &[RollbackRetrying, TimeoutRollbackRetrying, TimeoutRollbacking, Rollbacking];
    pub const FAIL_COMMIT: &'static [GlobalStatus] = &[CommitFailed, CommitRetryTimeout];
    pub const FAIL_ROLLBACK: &'static [GlobalStatus] =
        &[TimeoutRollbacked, RollbackFailed, RollbackRetryTimeout, TimeoutRollbackRetryTimeout];
    pub const FINISH: &'static [GlobalStatus] = &[Committed, Finished, Rollbacked];
    pub const STOP: &'static [GlobalStatus] = &[StopCommitOrCommitRetry, StopRollbackOrRollbackRetry];

    pub const ALL: [GlobalStatus; 21] = [
        Unknown,
        Begin,
        Committing,
        CommitRetrying,
        Rollbacking,
        RollbackRetrying,
        TimeoutRollbacking,
        TimeoutRollbackRetrying,
        AsyncCommitting,
        Committed,
        CommitFailed,
        Rollbacked,
        RollbackFailed,
        TimeoutRollbacked,
        TimeoutRollbackRetryTimeout,
        Finished,
        CommitRetryTimeout,
        RollbackRetryTimeout,
        Deleting,
        StopCommitOrCommitRetry,
        StopRollbackOrRollbackRetry,
    ];

    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|status| status.code() == code)
    }

    pub fn is_one_of(self, statuses: &[GlobalStatus]) -> bool {
        statuses.contains(&self)
    }

    /// Statuses a commit drive may start from.
    pub fn is_commit_bound(self) -> bool {
        matches!(self, Committing | CommitRetrying | AsyncCommitting | StopCommitOrCommitRetry)
    }

    /// Statuses a rollback drive may start from.
    pub fn is_rollback_bound(self) -> bool {
        matches!(
            self,
            Rollbacking | RollbackRetrying | TimeoutRollbacking | TimeoutRollbackRetrying | StopRollbackOrRollbackRetry
        )
    }

    pub fn is_timeout_rollback(self) -> bool {
        matches!(self, TimeoutRollbacking | TimeoutRollbackRetrying)
    }

    /// Outcome of a commit decision as seen by the transaction manager.
    pub fn is_commit_outcome(self) -> bool {
        matches!(self, Committed | CommitFailed | CommitRetryTimeout)
    }

    pub fn is_rollback_outcome(self) -> bool {
        matches!(
            self,
            Rollbacked | RollbackFailed | TimeoutRollbacked | RollbackRetryTimeout | TimeoutRollbackRetryTimeout
        )
    }

    /// Whether sessions in this status keep their branches' row locks.
    pub fn holds_row_locks(self) -> bool {
        !matches!(
            self,
            Unknown
                | AsyncCommitting
                | Committed
                | Rollbacked
                | TimeoutRollbacked
                | Finished
                | RollbackRetryTimeout
                | TimeoutRollbackRetryTimeout
        )
    }

    /// Permitted edges of the global state machine. Self edges are permitted for statuses a
    /// driver may re-enter while retrying.
    pub fn can_transit_to(self, to: GlobalStatus) -> bool {
        if to == Deleting {
            return self != Unknown;
        }
        if self == to {
            return matches!(
                self,
                CommitRetrying | AsyncCommitting | RollbackRetrying | TimeoutRollbackRetrying | TimeoutRollbacking
            );
        }
        match self {
            Begin => matches!(to, Committing | AsyncCommitting | Rollbacking | TimeoutRollbacking),
            Committing => matches!(to, Committed | CommitFailed | CommitRetrying | StopCommitOrCommitRetry),
            CommitRetrying => matches!(to, Committed | CommitFailed | CommitRetryTimeout | StopCommitOrCommitRetry),
            AsyncCommitting => matches!(to, Committed | CommitFailed | CommitRetryTimeout),
            Rollbacking => matches!(
                to,
                Rollbacked | RollbackFailed | RollbackRetrying | TimeoutRollbacking | StopRollbackOrRollbackRetry
            ),
            RollbackRetrying | TimeoutRollbacking | TimeoutRollbackRetrying => matches!(
                to,
                Rollbacked
                    | TimeoutRollbacked
                    | RollbackFailed
                    | RollbackRetrying
                    | TimeoutRollbackRetrying
                    | RollbackRetryTimeout
                    | TimeoutRollbackRetryTimeout
                    | StopRollbackOrRollbackRetry
            ),
            StopCommitOrCommitRetry => matches!(to, CommitRetrying | Committed | CommitFailed),
            StopRollbackOrRollbackRetry => matches!(to, RollbackRetrying | Rollbacked | RollbackFailed),
            CommitFailed | CommitRetryTimeout => to == CommitRetrying,
            RollbackFailed | RollbackRetryTimeout | TimeoutRollbackRetryTimeout | TimeoutRollbacked => {
                to == RollbackRetrying
            },
            Committed | Rollbacked => to == Finished,
            Unknown | Finished | Deleting => false,
        }
    }
}

impl Display for GlobalStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Status of a branch transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum BranchStatus {
    Unknown = 0,
    Registered = 1,
    PhaseOneDone = 2,
    PhaseOneFailed = 3,
    PhaseOneTimeout = 4,
    PhaseTwoCommitted = 5,
    PhaseTwoCommitFailedRetryable = 6,
    PhaseTwoCommitFailed = 7,
    PhaseTwoRollbacked = 8,
    PhaseTwoRollbackFailedRetryable = 9,
    PhaseTwoRollbackFailedUnretryable = 10,
    PhaseTwoRollbackFailed = 11,
}

impl BranchStatus {
    const ALL: [BranchStatus; 12] = [
        Self::Unknown,
        Self::Registered,
        Self::PhaseOneDone,
        Self::PhaseOneFailed,
        Self::PhaseOneTimeout,
        Self::PhaseTwoCommitted,
        Self::PhaseTwoCommitFailedRetryable,
        Self::PhaseTwoCommitFailed,
        Self::PhaseTwoRollbacked,
        Self::PhaseTwoRollbackFailedRetryable,
        Self::PhaseTwoRollbackFailedUnretryable,
        Self::PhaseTwoRollbackFailed,
    ];

    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|status| status.code() == code)
    }

    pub fn is_phase_one(self) -> bool {
        matches!(self, Self::Registered | Self::PhaseOneDone | Self::PhaseOneFailed | Self::PhaseOneTimeout)
    }

    pub fn is_phase_two(self) -> bool {
        self.code() >= Self::PhaseTwoCommitted.code()
    }
}

impl Display for BranchStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Registered => "Registered",
            Self::PhaseOneDone => "PhaseOne_Done",
            Self::PhaseOneFailed => "PhaseOne_Failed",
            Self::PhaseOneTimeout => "PhaseOne_Timeout",
            Self::PhaseTwoCommitted => "PhaseTwo_Committed",
            Self::PhaseTwoCommitFailedRetryable => "PhaseTwo_CommitFailed_Retryable",
            Self::PhaseTwoCommitFailed => "PhaseTwo_CommitFailed",
            Self::PhaseTwoRollbacked => "PhaseTwo_Rollbacked",
            Self::PhaseTwoRollbackFailedRetryable => "PhaseTwo_RollbackFailed_Retryable",
            Self::PhaseTwoRollbackFailedUnretryable => "PhaseTwo_RollbackFailed_Unretryable",
            Self::PhaseTwoRollbackFailed => "PhaseTwo_RollbackFailed",
        };
        f.write_str(name)
    }
}
