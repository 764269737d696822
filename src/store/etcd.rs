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

use anyhow::anyhow;
use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, GetOptions, KeyValue, Txn, TxnOp};
use prost::Message;
use tracing::{debug, warn};

use super::{GlobalSessionRecord, Result, SessionStore, StoreError};
use crate::etcd::{EtcdHelper, EtcdUri};
use crate::session::{BranchSession, GlobalSession, GlobalStatus};

const MAX_TXN_ATTEMPTS: usize = 8;

fn decode_session(kv: &KeyValue) -> Result<GlobalSession> {
    let record = GlobalSessionRecord::decode(kv.value())
        .map_err(|err| StoreError::corrupted(format!("session {:?}: {err}", kv.key_str())))?;
    GlobalSession::try_from(record)
}

/// Sessions persisted in etcd, one key per global session under `{root}/sessions/`.
///
/// Mutations are read-modify-write transactions guarded by the key's mod revision.
#[derive(Clone)]
pub struct EtcdSessionStore {
    client: Client,
    root: String,
}

impl EtcdSessionStore {
    pub fn new(client: Client, root: impl Into<String>) -> Self {
        Self { client, root: root.into() }
    }

    pub async fn connect(uri: &EtcdUri) -> anyhow::Result<Self> {
        let client = EtcdHelper::connect(uri).await?;
        Ok(Self::new(client, uri.root.clone()))
    }

    fn prefix(&self) -> String {
        format!("{}/sessions/", self.root)
    }

    fn key(&self, xid: &str) -> String {
        format!("{}/sessions/{xid}", self.root)
    }

    async fn get(&self, xid: &str) -> Result<Option<(i64, GlobalSession)>> {
        let response = self.client.kv_client().get(self.key(xid), None).await.map_err(anyhow::Error::from)?;
        match response.kvs().first() {
            None => Ok(None),
            Some(kv) => Ok(Some((kv.mod_revision(), decode_session(kv)?))),
        }
    }

    /// Applies `modify` to stored session and returns the modified session. Absent session is
    /// skipped if `missing_ok`.
    async fn modify<F>(&self, xid: &str, missing_ok: bool, modify: F) -> Result<Option<GlobalSession>>
    where
        F: Fn(&mut GlobalSession) -> Result<()> + Send + Sync,
    {
        let key = self.key(xid);
        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let Some((revision, mut session)) = self.get(xid).await? else {
                if missing_ok {
                    return Ok(None);
                }
                return Err(StoreError::session_not_found(xid));
            };
            modify(&mut session)?;
            let put = TxnOp::put(key.as_str(), GlobalSessionRecord::from(&session).encode_to_vec(), None);
            let txn = Txn::new().when([Compare::mod_revision(key.as_str(), CompareOp::Equal, revision)]).and_then([put]);
            let response = self.client.kv_client().txn(txn).await.map_err(anyhow::Error::from)?;
            if response.succeeded() {
                return Ok(Some(session));
            }
            debug!("session {xid} modified concurrently in attempt {attempt}, retrying");
        }
        Err(anyhow!("fail to modify session {xid} after {MAX_TXN_ATTEMPTS} attempts").into())
    }
}

#[async_trait]
impl SessionStore for EtcdSessionStore {
    async fn add_global_session(&self, session: &GlobalSession) -> Result<()> {
        let key = self.key(&session.xid);
        let put = TxnOp::put(key.as_str(), GlobalSessionRecord::from(session).encode_to_vec(), None);
        let txn = Txn::new().when([Compare::create_revision(key.as_str(), CompareOp::Equal, 0)]).and_then([put]);
        let response = self.client.kv_client().txn(txn).await.map_err(anyhow::Error::from)?;
        if !response.succeeded() {
            return Err(StoreError::SessionAlreadyExists { xid: session.xid.clone() });
        }
        Ok(())
    }

    async fn update_global_session(&self, session: &GlobalSession) -> Result<GlobalSession> {
        let updated = self
            .modify(&session.xid, false, |stored| {
                let branches = std::mem::take(stored.branches_mut());
                *stored = session.clone().with_branches(branches);
                Ok(())
            })
            .await?;
        updated.ok_or_else(|| StoreError::session_not_found(&session.xid))
    }

    async fn remove_global_session(&self, xid: &str) -> Result<()> {
        self.client.kv_client().delete(self.key(xid), None).await.map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn add_branch_session(&self, branch: &BranchSession) -> Result<()> {
        self.modify(&branch.xid, false, |stored| {
            if stored.status != GlobalStatus::Begin {
                return Err(StoreError::SessionNotActive { xid: branch.xid.clone(), status: stored.status });
            }
            stored.add_branch(branch.clone());
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn update_branch_session(&self, branch: &BranchSession) -> Result<()> {
        self.modify(&branch.xid, false, |stored| match stored.find_branch_mut(branch.branch_id) {
            None => Err(StoreError::BranchNotFound { xid: branch.xid.clone(), branch_id: branch.branch_id }),
            Some(stored) => {
                *stored = branch.clone();
                Ok(())
            },
        })
        .await?;
        Ok(())
    }

    async fn remove_branch_session(&self, xid: &str, branch_id: u64) -> Result<()> {
        self.modify(xid, true, |stored| {
            stored.remove_branch(branch_id);
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn find_global_session(&self, xid: &str) -> Result<Option<GlobalSession>> {
        Ok(self.get(xid).await?.map(|(_revision, session)| session))
    }

    async fn find_global_sessions(&self, statuses: &[GlobalStatus]) -> Result<Vec<GlobalSession>> {
        let options = GetOptions::new().with_prefix();
        let response = self.client.kv_client().get(self.prefix(), Some(options)).await.map_err(anyhow::Error::from)?;
        let mut sessions = Vec::new();
        for kv in response.kvs() {
            let session = match decode_session(kv) {
                Ok(session) => session,
                Err(err) => {
                    warn!("skip undecodable session record {:?}: {err}", kv.key_str());
                    continue;
                },
            };
            if session.status.is_one_of(statuses) {
                sessions.push(session);
            }
        }
        sessions.sort_by_key(|session| session.begin_time);
        Ok(sessions)
    }
}
