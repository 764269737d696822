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
use etcd_client::{Client, Compare, CompareOp, KeyValue, Txn, TxnOp};
use prost::Message;
use tracing::{debug, trace, warn};

use super::{LockHolder, LockStore, LockStoreError, Result, RowLock};
use crate::etcd::{EtcdHelper, EtcdUri};

// Bounds optimistic retries under contention on the same rows.
const MAX_TXN_ATTEMPTS: usize = 8;

// Default `--max-txn-ops` of etcd servers.
const MAX_TXN_OPS: usize = 128;

#[derive(Clone, PartialEq, prost::Message)]
struct LockHolderRecord {
    #[prost(string, tag = "1")]
    xid: String,
    #[prost(uint64, tag = "2")]
    transaction_id: u64,
    #[prost(uint64, tag = "3")]
    branch_id: u64,
}

impl From<&RowLock> for LockHolderRecord {
    fn from(lock: &RowLock) -> Self {
        Self { xid: lock.xid.clone(), transaction_id: lock.transaction_id, branch_id: lock.branch_id }
    }
}

impl From<LockHolderRecord> for LockHolder {
    fn from(record: LockHolderRecord) -> Self {
        Self { xid: record.xid, transaction_id: record.transaction_id, branch_id: record.branch_id }
    }
}

fn decode_holder(kv: &KeyValue) -> Result<LockHolder> {
    let record = LockHolderRecord::decode(kv.value())
        .map_err(|err| LockStoreError::corrupted(format!("lock holder {:?}: {err}", kv.key_str())))?;
    Ok(record.into())
}

/// Row locks persisted in etcd under `{root}/locks/`.
///
/// Rows are locked with etcd transactions, so a lock set either lands as a whole or not at all.
/// Sets exceeding one transaction are locked chunk by chunk, a conflict in a later chunk
/// unlocks rows of earlier ones.
#[derive(Clone)]
pub struct EtcdLockStore {
    client: Client,
    root: String,
}

impl EtcdLockStore {
    pub fn new(client: Client, root: impl Into<String>) -> Self {
        Self { client, root: root.into() }
    }

    pub async fn connect(uri: &EtcdUri) -> anyhow::Result<Self> {
        let client = EtcdHelper::connect(uri).await?;
        Ok(Self::new(client, uri.root.clone()))
    }

    fn key(&self, lock: &RowLock) -> String {
        format!("{}/locks/{}", self.root, lock.row_key())
    }

    async fn read(&self, keys: &[String]) -> Result<Vec<Option<KeyValue>>> {
        let mut kvs = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(MAX_TXN_OPS) {
            let gets: Vec<_> = chunk.iter().map(|key| TxnOp::get(key.as_str(), None)).collect();
            let txn = Txn::new().and_then(gets);
            let response = self.client.kv_client().txn(txn).await.map_err(anyhow::Error::from)?;
            let gets = EtcdHelper::into_gets(response)?;
            kvs.extend(gets.into_iter().map(|get| get.kvs().first().cloned()));
        }
        Ok(kvs)
    }

    /// Locks rows fitting in one etcd transaction. Returns rows not locked before, or `None`
    /// if any row is held by other transactions.
    async fn acquire_chunk(&self, locks: &[RowLock]) -> Result<Option<Vec<RowLock>>> {
        let keys: Vec<String> = locks.iter().map(|lock| self.key(lock)).collect();
        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let existings = self.read(&keys).await?;
            let mut compares = Vec::with_capacity(keys.len());
            let mut puts = Vec::new();
            let mut locked = Vec::new();
            for ((lock, key), existing) in locks.iter().zip(keys.iter()).zip(existings) {
                match existing {
                    Some(kv) => {
                        let holder = decode_holder(&kv)?;
                        if holder.xid != lock.xid {
                            trace!("row {key} of {} held by {}", lock.xid, holder.xid);
                            return Ok(None);
                        }
                        compares.push(Compare::mod_revision(key.as_str(), CompareOp::Equal, kv.mod_revision()));
                    },
                    None => {
                        compares.push(Compare::create_revision(key.as_str(), CompareOp::Equal, 0));
                        puts.push(TxnOp::put(key.as_str(), LockHolderRecord::from(lock).encode_to_vec(), None));
                        locked.push(lock.clone());
                    },
                }
            }
            if puts.is_empty() {
                return Ok(Some(locked));
            }
            let txn = Txn::new().when(compares).and_then(puts);
            let response = self.client.kv_client().txn(txn).await.map_err(anyhow::Error::from)?;
            if response.succeeded() {
                return Ok(Some(locked));
            }
            debug!("lock rows contended in attempt {attempt}, retrying");
        }
        Err(anyhow!("fail to lock rows after {MAX_TXN_ATTEMPTS} attempts").into())
    }

    async fn release_chunk(&self, locks: &[RowLock]) -> Result<()> {
        let keys: Vec<String> = locks.iter().map(|lock| self.key(lock)).collect();
        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let existings = self.read(&keys).await?;
            let mut compares = Vec::new();
            let mut deletes = Vec::new();
            for ((lock, key), existing) in locks.iter().zip(keys.iter()).zip(existings) {
                let Some(kv) = existing else {
                    continue;
                };
                if lock.is_held_by_branch(&decode_holder(&kv)?) {
                    compares.push(Compare::mod_revision(key.as_str(), CompareOp::Equal, kv.mod_revision()));
                    deletes.push(TxnOp::delete(key.as_str(), None));
                }
            }
            if deletes.is_empty() {
                return Ok(());
            }
            let txn = Txn::new().when(compares).and_then(deletes);
            let response = self.client.kv_client().txn(txn).await.map_err(anyhow::Error::from)?;
            if response.succeeded() {
                return Ok(());
            }
            debug!("unlock rows contended in attempt {attempt}, retrying");
        }
        Err(anyhow!("fail to unlock rows after {MAX_TXN_ATTEMPTS} attempts").into())
    }
}

#[async_trait]
impl LockStore for EtcdLockStore {
    async fn acquire(&self, locks: &[RowLock]) -> Result<bool> {
        let mut locked = Vec::new();
        for chunk in locks.chunks(MAX_TXN_OPS) {
            match self.acquire_chunk(chunk).await {
                Ok(Some(rows)) => locked.extend(rows),
                Ok(None) => {
                    self.release(&locked).await?;
                    return Ok(false);
                },
                Err(err) => {
                    if let Err(unlock_err) = self.release(&locked).await {
                        warn!("fail to unlock {} rows locked partially: {unlock_err}", locked.len());
                    }
                    return Err(err);
                },
            }
        }
        Ok(true)
    }

    async fn release(&self, locks: &[RowLock]) -> Result<()> {
        for chunk in locks.chunks(MAX_TXN_OPS) {
            self.release_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn query_owner(&self, row_key: &str) -> Result<Option<LockHolder>> {
        let key = format!("{}/locks/{row_key}", self.root);
        let response = self.client.kv_client().get(key, None).await.map_err(anyhow::Error::from)?;
        match response.kvs().first() {
            None => Ok(None),
            Some(kv) => Ok(Some(decode_holder(kv)?)),
        }
    }
}
