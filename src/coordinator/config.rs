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

pub const DEFAULT_BRANCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(1);
pub const DEFAULT_UNDO_LOG_DELETE_PERIOD: Duration = Duration::from_secs(24 * 3600);
pub const DEFAULT_DEAD_SESSION_THRESHOLD: Duration = Duration::from_secs(10);
pub const DEFAULT_SCHEDULER_LOCK_LEASE: Duration = Duration::from_secs(60);

/// Settings of one coordinator node.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub(crate) node_id: u16,
    pub(crate) address: String,
    pub(crate) branch_timeout: Duration,
    pub(crate) max_commit_retry_timeout: Option<Duration>,
    pub(crate) max_rollback_retry_timeout: Option<Duration>,
    pub(crate) rollback_retry_timeout_unlock: bool,
    pub(crate) async_commit: bool,
    pub(crate) committing_retry_period: Duration,
    pub(crate) async_committing_retry_period: Duration,
    pub(crate) rollbacking_retry_period: Duration,
    pub(crate) timeout_retry_period: Duration,
    pub(crate) undo_log_delete_period: Duration,
    pub(crate) undo_log_save_days: u32,
    pub(crate) timeout_rollback_grace: Duration,
    pub(crate) dead_session_threshold: Duration,
    pub(crate) scan_parallelism: usize,
    pub(crate) scheduler_lock_lease: Duration,
    pub(crate) scheduler_lock_owner: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            address: "127.0.0.1:8091".to_string(),
            branch_timeout: DEFAULT_BRANCH_TIMEOUT,
            max_commit_retry_timeout: None,
            max_rollback_retry_timeout: None,
            rollback_retry_timeout_unlock: false,
            async_commit: false,
            committing_retry_period: DEFAULT_RETRY_PERIOD,
            async_committing_retry_period: DEFAULT_RETRY_PERIOD,
            rollbacking_retry_period: DEFAULT_RETRY_PERIOD,
            timeout_retry_period: DEFAULT_RETRY_PERIOD,
            undo_log_delete_period: DEFAULT_UNDO_LOG_DELETE_PERIOD,
            undo_log_save_days: 7,
            timeout_rollback_grace: Duration::ZERO,
            dead_session_threshold: DEFAULT_DEAD_SESSION_THRESHOLD,
            scan_parallelism: 16,
            scheduler_lock_lease: DEFAULT_SCHEDULER_LOCK_LEASE,
            scheduler_lock_owner: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn new(node_id: u16, address: impl Into<String>) -> Self {
        Self { node_id, address: address.into(), ..Default::default() }
    }

    pub fn with_branch_timeout(self, branch_timeout: Duration) -> Self {
        Self { branch_timeout, ..self }
    }

    /// Bounds commit retries, measured from transaction begin. `None` retries forever.
    pub fn with_max_commit_retry_timeout(self, timeout: Option<Duration>) -> Self {
        Self { max_commit_retry_timeout: timeout, ..self }
    }

    /// Bounds rollback retries, measured from transaction begin. `None` retries forever.
    pub fn with_max_rollback_retry_timeout(self, timeout: Option<Duration>) -> Self {
        Self { max_rollback_retry_timeout: timeout, ..self }
    }

    /// Releases row locks of sessions exhausting rollback retries. Without it such sessions keep
    /// their locks and are retried until an operator steps in.
    pub fn with_rollback_retry_timeout_unlock(self, unlock: bool) -> Self {
        Self { rollback_retry_timeout_unlock: unlock, ..self }
    }

    pub fn with_async_commit(self, async_commit: bool) -> Self {
        Self { async_commit, ..self }
    }

    pub fn with_committing_retry_period(self, period: Duration) -> Self {
        Self { committing_retry_period: period, ..self }
    }

    pub fn with_async_committing_retry_period(self, period: Duration) -> Self {
        Self { async_committing_retry_period: period, ..self }
    }

    pub fn with_rollbacking_retry_period(self, period: Duration) -> Self {
        Self { rollbacking_retry_period: period, ..self }
    }

    pub fn with_timeout_retry_period(self, period: Duration) -> Self {
        Self { timeout_retry_period: period, ..self }
    }

    pub fn with_undo_log_delete_period(self, period: Duration) -> Self {
        Self { undo_log_delete_period: period, ..self }
    }

    pub fn with_undo_log_save_days(self, days: u32) -> Self {
        Self { undo_log_save_days: days, ..self }
    }

    pub fn with_timeout_rollback_grace(self, grace: Duration) -> Self {
        Self { timeout_rollback_grace: grace, ..self }
    }

    pub fn with_dead_session_threshold(self, threshold: Duration) -> Self {
        Self { dead_session_threshold: threshold, ..self }
    }

    pub fn with_scan_parallelism(self, parallelism: usize) -> Self {
        Self { scan_parallelism: parallelism.max(1), ..self }
    }

    pub fn with_scheduler_lock_lease(self, lease: Duration) -> Self {
        Self { scheduler_lock_lease: lease, ..self }
    }

    pub fn with_scheduler_lock_owner(self, owner: impl Into<String>) -> Self {
        Self { scheduler_lock_owner: Some(owner.into()), ..self }
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn scheduler_lock_owner(&self) -> &str {
        self.scheduler_lock_owner.as_deref().unwrap_or(&self.address)
    }
}
