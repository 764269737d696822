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

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use hashbrown::HashMap;

use super::DistributedLocker;
use crate::clock::{millis_of, Clock, Millis};

struct Lease {
    owner: String,
    expire_time: Millis,
}

/// Locker for coordinators sharing one process.
pub struct MemoryDistributedLocker {
    clock: Clock,
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryDistributedLocker {
    pub fn new(clock: Clock) -> Self {
        Self { clock, leases: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl DistributedLocker for MemoryDistributedLocker {
    async fn try_acquire(&self, name: &str, owner: &str, lease: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expire_time = now.saturating_add(millis_of(lease));
        let mut leases = self.leases.lock().unwrap();
        match leases.get_mut(name) {
            Some(held) if held.owner != owner && held.expire_time > now => Ok(false),
            Some(held) => {
                held.owner = owner.to_string();
                held.expire_time = expire_time;
                Ok(true)
            },
            None => {
                leases.insert(name.to_string(), Lease { owner: owner.to_string(), expire_time });
                Ok(true)
            },
        }
    }

    async fn release(&self, name: &str, owner: &str) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap();
        let now = self.clock.now();
        match leases.get(name) {
            Some(held) if held.owner == owner => {
                let live = held.expire_time > now;
                leases.remove(name);
                Ok(live)
            },
            _ => Ok(false),
        }
    }
}
