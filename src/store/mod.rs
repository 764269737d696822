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

//! Durable storage of global sessions and their branches.

mod etcd;
mod memory;
mod record;

use async_trait::async_trait;
use thiserror::Error;

pub use self::etcd::EtcdSessionStore;
pub use self::memory::MemorySessionStore;
pub use self::record::{BranchSessionRecord, GlobalSessionRecord};
use crate::session::{BranchSession, GlobalSession, GlobalStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("global session {xid} not found")]
    SessionNotFound { xid: String },
    #[error("global session {xid} already exists")]
    SessionAlreadyExists { xid: String },
    #[error("global session {xid} in status {status} accepts no more branches")]
    SessionNotActive { xid: String, status: GlobalStatus },
    #[error("branch {branch_id} of {xid} not found")]
    BranchNotFound { xid: String, branch_id: u64 },
    #[error("session record corrupted: {message}")]
    Corrupted { message: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    pub fn session_not_found(xid: impl Into<String>) -> Self {
        Self::SessionNotFound { xid: xid.into() }
    }

    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted { message: message.into() }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Ground truth of every live global transaction.
///
/// Branches are stored as part of their global session, so branch mutations are atomic with
/// respect to the parent record.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn add_global_session(&self, session: &GlobalSession) -> Result<()>;

    /// Updates global fields of stored session, branches are left as stored. Returns the
    /// session as stored after update.
    async fn update_global_session(&self, session: &GlobalSession) -> Result<GlobalSession>;

    /// Removes session and all its branches. Removing an absent session succeeds.
    async fn remove_global_session(&self, xid: &str) -> Result<()>;

    /// Appends branch to the end of stored branches of its global session.
    ///
    /// Fails with [StoreError::SessionNotActive] unless the stored session is in `Begin`.
    async fn add_branch_session(&self, branch: &BranchSession) -> Result<()>;

    async fn update_branch_session(&self, branch: &BranchSession) -> Result<()>;

    /// Removes branch from its global session. Removing an absent branch succeeds.
    async fn remove_branch_session(&self, xid: &str, branch_id: u64) -> Result<()>;

    async fn find_global_session(&self, xid: &str) -> Result<Option<GlobalSession>>;

    /// Sessions in any of given statuses, oldest first.
    async fn find_global_sessions(&self, statuses: &[GlobalStatus]) -> Result<Vec<GlobalSession>>;
}
