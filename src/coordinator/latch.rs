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

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Latch {
    mutex: Arc<AsyncMutex<()>>,
    // Latches held or waited for.
    users: usize,
}

/// Serializes mutations of the same xid inside one coordinator process.
#[derive(Default)]
pub struct XidLatches {
    latches: Mutex<HashMap<String, Latch>>,
}

/// Exclusive right to mutate a global session. Released on drop.
///
/// It counts as a user of its xid from creation, so waiters abandoned before being latched
/// are forgotten on drop too.
pub struct XidLatch<'a> {
    latches: &'a XidLatches,
    xid: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl XidLatches {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&self, xid: &str) -> (XidLatch<'_>, Arc<AsyncMutex<()>>) {
        let mut latches = self.latches.lock().unwrap();
        let latch = latches.entry_ref(xid).or_insert_with(|| Latch { mutex: Arc::new(AsyncMutex::new(())), users: 0 });
        latch.users += 1;
        (XidLatch { latches: self, xid: xid.to_string(), guard: None }, latch.mutex.clone())
    }

    fn leave(&self, xid: &str) {
        let mut latches = self.latches.lock().unwrap();
        let Some(latch) = latches.get_mut(xid) else {
            return;
        };
        latch.users -= 1;
        if latch.users == 0 {
            latches.remove(xid);
        }
    }

    pub async fn lock(&self, xid: &str) -> XidLatch<'_> {
        let (mut latch, mutex) = self.enter(xid);
        latch.guard = Some(mutex.lock_owned().await);
        latch
    }

    /// Latches `xid` unless someone in this process is working on it.
    pub fn try_lock(&self, xid: &str) -> Option<XidLatch<'_>> {
        let (mut latch, mutex) = self.enter(xid);
        latch.guard = Some(mutex.try_lock_owned().ok()?);
        Some(latch)
    }

    pub fn len(&self) -> usize {
        self.latches.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for XidLatch<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.latches.leave(&self.xid);
    }
}
