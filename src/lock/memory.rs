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
use tracing::trace;

use super::{LockHolder, LockStore, Result, RowLock};

/// Process local row lock table.
#[derive(Default)]
pub struct MemoryLockStore {
    rows: Mutex<BTreeMap<String, LockHolder>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn acquire(&self, locks: &[RowLock]) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let keys: Vec<String> = locks.iter().map(|lock| lock.row_key()).collect();
        for (lock, key) in locks.iter().zip(keys.iter()) {
            if let Some(holder) = rows.get(key) {
                if holder.xid != lock.xid {
                    trace!("row {key} of {} held by {}", lock.xid, holder.xid);
                    return Ok(false);
                }
            }
        }
        for (lock, key) in locks.iter().zip(keys) {
            rows.entry(key).or_insert_with(|| lock.holder());
        }
        Ok(true)
    }

    async fn release(&self, locks: &[RowLock]) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        for lock in locks {
            if let Entry::Occupied(entry) = rows.entry(lock.row_key()) {
                if lock.is_held_by_branch(entry.get()) {
                    entry.remove();
                }
            }
        }
        Ok(())
    }

    async fn query_owner(&self, row_key: &str) -> Result<Option<LockHolder>> {
        Ok(self.rows.lock().unwrap().get(row_key).cloned())
    }
}
