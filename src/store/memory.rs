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

use std::collections::btree_map::{BTreeMap, Entry};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Result, SessionStore, StoreError};
use crate::session::{BranchSession, GlobalSession, GlobalStatus};

/// Sessions kept in process memory. They do not survive restarts of the process, but do
/// survive restarts of coordinators sharing the store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<BTreeMap<String, GlobalSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn add_global_session(&self, session: &GlobalSession) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.entry(session.xid.clone()) {
            Entry::Occupied(_) => Err(StoreError::SessionAlreadyExists { xid: session.xid.clone() }),
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
                Ok(())
            },
        }
    }

    async fn update_global_session(&self, session: &GlobalSession) -> Result<GlobalSession> {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(stored) = sessions.get_mut(&session.xid) else {
            return Err(StoreError::session_not_found(&session.xid));
        };
        let branches = std::mem::take(stored.branches_mut());
        *stored = session.clone().with_branches(branches);
        Ok(stored.clone())
    }

    async fn remove_global_session(&self, xid: &str) -> Result<()> {
        self.sessions.lock().unwrap().remove(xid);
        Ok(())
    }

    async fn add_branch_session(&self, branch: &BranchSession) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(stored) = sessions.get_mut(&branch.xid) else {
            return Err(StoreError::session_not_found(&branch.xid));
        };
        if stored.status != GlobalStatus::Begin {
            return Err(StoreError::SessionNotActive { xid: branch.xid.clone(), status: stored.status });
        }
        stored.add_branch(branch.clone());
        Ok(())
    }

    async fn update_branch_session(&self, branch: &BranchSession) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(stored) = sessions.get_mut(&branch.xid) else {
            return Err(StoreError::session_not_found(&branch.xid));
        };
        let Some(stored) = stored.find_branch_mut(branch.branch_id) else {
            return Err(StoreError::BranchNotFound { xid: branch.xid.clone(), branch_id: branch.branch_id });
        };
        *stored = branch.clone();
        Ok(())
    }

    async fn remove_branch_session(&self, xid: &str, branch_id: u64) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(stored) = sessions.get_mut(xid) {
            stored.remove_branch(branch_id);
        }
        Ok(())
    }

    async fn find_global_session(&self, xid: &str) -> Result<Option<GlobalSession>> {
        Ok(self.sessions.lock().unwrap().get(xid).cloned())
    }

    async fn find_global_sessions(&self, statuses: &[GlobalStatus]) -> Result<Vec<GlobalSession>> {
        let sessions = self.sessions.lock().unwrap();
        let mut found: Vec<_> =
            sessions.values().filter(|session| session.status.is_one_of(statuses)).cloned().collect();
        found.sort_by_key(|session| session.begin_time);
        Ok(found)
    }
}
