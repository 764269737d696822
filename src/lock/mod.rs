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

//! Global row locks isolating writes of concurrent global transactions.

mod etcd;
mod manager;
mod memory;

use std::fmt::{self, Display, Formatter};

use async_trait::async_trait;
use compact_str::CompactString;
use thiserror::Error;

pub use self::etcd::EtcdLockStore;
pub use self::manager::LockManager;
pub use self::memory::MemoryLockStore;

const ROW_KEY_SEPARATOR: &str = "^^^";

#[derive(Debug, Error)]
pub enum LockStoreError {
    #[error("invalid lock key {lock_key:?}: {message}")]
    InvalidLockKey { lock_key: String, message: &'static str },
    #[error("lock record corrupted: {message}")]
    Corrupted { message: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LockStoreError {
    fn invalid_lock_key(lock_key: &str, message: &'static str) -> Self {
        Self::InvalidLockKey { lock_key: lock_key.to_string(), message }
    }

    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted { message: message.into() }
    }
}

pub type Result<T, E = LockStoreError> = std::result::Result<T, E>;

/// Owner of a locked row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockHolder {
    pub xid: String,
    pub transaction_id: u64,
    pub branch_id: u64,
}

/// A single row a branch wants exclusive ownership of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowLock {
    pub xid: String,
    pub transaction_id: u64,
    pub branch_id: u64,
    pub resource_id: CompactString,
    pub table_name: CompactString,
    pub pk: CompactString,
}

impl RowLock {
    /// Store key identifying the row across all transactions.
    pub fn row_key(&self) -> String {
        row_key(&self.resource_id, &self.table_name, &self.pk)
    }

    pub fn holder(&self) -> LockHolder {
        LockHolder { xid: self.xid.clone(), transaction_id: self.transaction_id, branch_id: self.branch_id }
    }

    /// Whether given holder owns this row on behalf of the same branch.
    pub fn is_held_by_branch(&self, holder: &LockHolder) -> bool {
        holder.xid == self.xid && holder.branch_id == self.branch_id
    }
}

impl Display for RowLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table_name, self.pk)
    }
}

pub fn row_key(resource_id: &str, table_name: &str, pk: &str) -> String {
    format!("{resource_id}{ROW_KEY_SEPARATOR}{table_name}{ROW_KEY_SEPARATOR}{pk}")
}

/// Owner of rows being locked, used to expand lock keys.
#[derive(Clone, Copy, Debug)]
pub struct LockOwner<'a> {
    pub xid: &'a str,
    pub transaction_id: u64,
    pub branch_id: u64,
    pub resource_id: &'a str,
}

/// Expands lock key `table1:pk1,pk2;table2:pk3` into row locks.
///
/// Duplicated rows are collapsed.
pub fn parse_lock_key(owner: LockOwner<'_>, lock_key: &str) -> Result<Vec<RowLock>> {
    let mut locks: Vec<RowLock> = Vec::new();
    for table_keys in lock_key.split(';').filter(|s| !s.is_empty()) {
        let Some((table_name, pks)) = table_keys.split_once(':') else {
            return Err(LockStoreError::invalid_lock_key(lock_key, "missing table separator"));
        };
        if table_name.is_empty() {
            return Err(LockStoreError::invalid_lock_key(lock_key, "empty table name"));
        }
        for pk in pks.split(',') {
            if pk.is_empty() {
                return Err(LockStoreError::invalid_lock_key(lock_key, "empty primary key"));
            }
            if locks.iter().any(|lock| lock.table_name == table_name && lock.pk == pk) {
                continue;
            }
            locks.push(RowLock {
                xid: owner.xid.to_string(),
                transaction_id: owner.transaction_id,
                branch_id: owner.branch_id,
                resource_id: owner.resource_id.into(),
                table_name: table_name.into(),
                pk: pk.into(),
            });
        }
    }
    Ok(locks)
}

/// Backing storage of row locks.
///
/// Implementations must be safe for concurrent use from many coordinator tasks.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Acquires all given rows or none of them.
    ///
    /// A row held by the same xid counts as acquired and keeps its original holder. Returns
    /// `false` if any row is held by another xid.
    async fn acquire(&self, locks: &[RowLock]) -> Result<bool>;

    /// Frees rows held by the branches of given locks. Rows held by others are untouched, so
    /// repeated releases are harmless.
    async fn release(&self, locks: &[RowLock]) -> Result<()>;

    async fn query_owner(&self, row_key: &str) -> Result<Option<LockHolder>>;
}
