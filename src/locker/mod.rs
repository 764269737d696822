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

//! Cluster wide mutual exclusion of named background tasks.

mod etcd;
mod memory;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use self::etcd::EtcdDistributedLocker;
pub use self::memory::MemoryDistributedLocker;

/// Named lease lock.
///
/// A holder that crashes loses its lock once the lease expires.
#[async_trait]
pub trait DistributedLocker: Send + Sync + 'static {
    /// Acquires or extends lock `name` for `owner`. Returns `false` if someone else holds it.
    async fn try_acquire(&self, name: &str, owner: &str, lease: Duration) -> Result<bool>;

    /// Releases lock `name` if held by `owner`. Returns whether it was held.
    async fn release(&self, name: &str, owner: &str) -> Result<bool>;
}
