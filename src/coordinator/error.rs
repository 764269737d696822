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

use thiserror::Error;

use crate::lock::LockStoreError;
use crate::remoting::RemotingError;
use crate::session::{GlobalStatus, IllegalTransition};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("fail to begin global transaction: {source}")]
    BeginFailed { source: StoreError },
    #[error("global lock of {lock_key:?} for {xid} conflicts with other transactions")]
    LockConflict { xid: String, lock_key: String },
    #[error("global transaction {xid} not found")]
    GlobalNotFound { xid: String },
    #[error("branch {branch_id} of {xid} not found")]
    BranchNotFound { xid: String, branch_id: u64 },
    #[error("global transaction {xid} in status {status} does not allow {operation}")]
    InvalidStatus { xid: String, status: GlobalStatus, operation: &'static str },
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error("fail to delete branch {branch_id} of {xid}, please try again")]
    BranchDeleteFailed { xid: String, branch_id: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    LockStore(LockStoreError),
    #[error(transparent)]
    Remoting(#[from] RemotingError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoordinatorError {
    pub fn global_not_found(xid: impl Into<String>) -> Self {
        Self::GlobalNotFound { xid: xid.into() }
    }

    pub fn branch_not_found(xid: impl Into<String>, branch_id: u64) -> Self {
        Self::BranchNotFound { xid: xid.into(), branch_id }
    }

    pub fn invalid_status(xid: impl Into<String>, status: GlobalStatus, operation: &'static str) -> Self {
        Self::InvalidStatus { xid: xid.into(), status, operation }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Whether the caller may retry the same request later, possibly after backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockConflict { .. } | Self::BranchDeleteFailed { .. } => true,
            Self::BeginFailed { .. } | Self::Store(_) | Self::LockStore(_) | Self::Remoting(_) => true,
            Self::GlobalNotFound { .. } | Self::BranchNotFound { .. } => false,
            Self::InvalidStatus { .. } | Self::InvalidArgument { .. } | Self::Internal(_) => false,
        }
    }
}

impl From<LockStoreError> for CoordinatorError {
    fn from(err: LockStoreError) -> Self {
        match err {
            LockStoreError::InvalidLockKey { .. } => Self::InvalidArgument { message: err.to_string() },
            err => Self::LockStore(err),
        }
    }
}

impl From<IllegalTransition> for CoordinatorError {
    fn from(err: IllegalTransition) -> Self {
        Self::Internal(err.into())
    }
}

pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;
