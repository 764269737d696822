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

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::session::{BranchSession, BranchStatus};

#[derive(Debug, Error)]
pub enum RemotingError {
    #[error("branch {branch_id} of {xid} got no response in {timeout:?}")]
    Timeout { xid: String, branch_id: u64, timeout: Duration },
    #[error("client {client_id} of resource {resource_id} unreachable")]
    ClientUnreachable { client_id: String, resource_id: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RemotingError {
    pub fn timeout(branch: &BranchSession, timeout: Duration) -> Self {
        Self::Timeout { xid: branch.xid.clone(), branch_id: branch.branch_id, timeout }
    }

    pub fn client_unreachable(branch: &BranchSession) -> Self {
        Self::ClientUnreachable { client_id: branch.client_id.clone(), resource_id: branch.resource_id.clone() }
    }
}

pub type Result<T, E = RemotingError> = std::result::Result<T, E>;

/// Delivers phase two requests to branch participants.
///
/// Calls for different branches may run concurrently. `timeout` bounds the wait for the
/// participant's answer, callers additionally enforce it on their side.
#[async_trait]
pub trait BranchRemoting: Send + Sync + 'static {
    async fn branch_commit(&self, branch: &BranchSession, timeout: Duration) -> Result<BranchStatus>;

    async fn branch_rollback(&self, branch: &BranchSession, timeout: Duration) -> Result<BranchStatus>;

    /// Asks the participant to drop everything of given branch. Returns whether it did.
    async fn branch_delete(&self, branch: &BranchSession, timeout: Duration) -> Result<bool>;

    /// Asks participants to purge undo logs older than `save_days`.
    async fn purge_undo_logs(&self, _save_days: u32) -> Result<()> {
        Ok(())
    }
}
