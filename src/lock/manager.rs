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

use std::sync::Arc;

use ignore_result::Ignore;
use tracing::{debug, warn};

use super::{parse_lock_key, LockOwner, LockStore, Result, RowLock};
use crate::session::{BranchSession, GlobalSession};

/// Translates branch lock keys to row locks in a [LockStore].
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    pub fn collect_row_locks(branch: &BranchSession) -> Result<Vec<RowLock>> {
        if !branch.holds_row_locks() {
            return Ok(Vec::new());
        }
        let owner = LockOwner {
            xid: &branch.xid,
            transaction_id: branch.transaction_id,
            branch_id: branch.branch_id,
            resource_id: &branch.resource_id,
        };
        parse_lock_key(owner, &branch.lock_key)
    }

    /// Locks all rows of given branch or none of them.
    ///
    /// On store failure, rows possibly locked by this call are released before the error returns.
    pub async fn acquire_lock(&self, branch: &BranchSession) -> Result<bool> {
        let locks = Self::collect_row_locks(branch)?;
        if locks.is_empty() {
            return Ok(true);
        }
        match self.store.acquire(&locks).await {
            Ok(acquired) => {
                debug!("branch {branch} acquired {} rows: {acquired}", locks.len());
                Ok(acquired)
            },
            Err(err) => {
                warn!("branch {branch} fail to lock rows: {err}");
                self.store.release(&locks).await.ignore();
                Err(err)
            },
        }
    }

    pub async fn release_lock(&self, branch: &BranchSession) -> Result<()> {
        let locks = Self::collect_row_locks(branch)?;
        if locks.is_empty() {
            return Ok(());
        }
        self.store.release(&locks).await
    }

    /// Releases rows of every branch in given session.
    pub async fn release_global_session_lock(&self, session: &GlobalSession) -> Result<()> {
        let mut locks = Vec::new();
        for branch in session.branches() {
            locks.extend(Self::collect_row_locks(branch)?);
        }
        if locks.is_empty() {
            return Ok(());
        }
        self.store.release(&locks).await
    }

    /// Whether rows of given lock key are free or held by given xid.
    pub async fn is_lockable(&self, xid: &str, resource_id: &str, lock_key: &str) -> Result<bool> {
        let owner = LockOwner { xid, transaction_id: 0, branch_id: 0, resource_id };
        for lock in parse_lock_key(owner, lock_key)? {
            if let Some(holder) = self.store.query_owner(&lock.row_key()).await? {
                if holder.xid != xid {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
