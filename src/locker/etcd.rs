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

use anyhow::Result;
use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, PutOptions, Txn, TxnOp};
use ignore_result::Ignore;
use tracing::{debug, trace};

use super::DistributedLocker;
use crate::etcd::{EtcdHelper, EtcdUri};

/// Locker backed by etcd keys `{root}/scheduler/{name}` attached to leases.
///
/// A holder extends its lock by renewing the lease the key is attached to.
#[derive(Clone)]
pub struct EtcdDistributedLocker {
    client: Client,
    root: String,
}

impl EtcdDistributedLocker {
    pub fn new(client: Client, root: impl Into<String>) -> Self {
        Self { client, root: root.into() }
    }

    pub async fn connect(uri: &EtcdUri) -> Result<Self> {
        let client = EtcdHelper::connect(uri).await?;
        Ok(Self::new(client, uri.root.clone()))
    }

    fn key(&self, name: &str) -> String {
        format!("{}/scheduler/{name}", self.root)
    }
}

#[async_trait]
impl DistributedLocker for EtcdDistributedLocker {
    async fn try_acquire(&self, name: &str, owner: &str, lease: Duration) -> Result<bool> {
        let key = self.key(name);
        let mut client = self.client.clone();

        // Held by owner, extend its lease.
        let response = client.get(key.as_str(), None).await?;
        if let Some(kv) = response.kvs().first() {
            if kv.value() != owner.as_bytes() {
                trace!("scheduler lock {name} held by others");
                return Ok(false);
            }
            if EtcdHelper::renew_lease(&mut client, kv.lease()).await? {
                return Ok(true);
            }
            debug!("lease of scheduler lock {name} expired, granting new one");
        }

        // Free or expired.
        let lease_id = EtcdHelper::grant_lease(&mut client, lease).await?;
        let put = TxnOp::put(key.as_str(), owner, Some(PutOptions::new().with_lease(lease_id)));
        let txn = Txn::new().when([Compare::create_revision(key.as_str(), CompareOp::Equal, 0)]).and_then([put]);
        if client.txn(txn).await?.succeeded() {
            return Ok(true);
        }
        trace!("scheduler lock {name} taken by others");
        client.lease_revoke(lease_id).await.ignore();
        Ok(false)
    }

    async fn release(&self, name: &str, owner: &str) -> Result<bool> {
        let key = self.key(name);
        let mut client = self.client.clone();
        let response = client.get(key.as_str(), None).await?;
        let Some(kv) = response.kvs().first() else {
            return Ok(false);
        };
        if kv.value() != owner.as_bytes() {
            return Ok(false);
        }
        let txn = Txn::new()
            .when([Compare::mod_revision(key.as_str(), CompareOp::Equal, kv.mod_revision())])
            .and_then([TxnOp::delete(key.as_str(), None)]);
        if !client.txn(txn).await?.succeeded() {
            return Ok(false);
        }
        client.lease_revoke(kv.lease()).await.ignore();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;
    use crate::etcd::tests::etcd_container;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_etcd_locker() {
        let etcd = etcd_container();
        let locker = EtcdDistributedLocker::connect(&etcd.uri()).await.unwrap();
        let lease = Duration::from_secs(2);

        assert_that!(locker.try_acquire("TimeoutCheck", "tc1", lease).await.unwrap()).is_true();
        assert_that!(locker.try_acquire("TimeoutCheck", "tc1", lease).await.unwrap()).is_true();
        assert_that!(locker.try_acquire("TimeoutCheck", "tc2", lease).await.unwrap()).is_false();
        assert_that!(locker.release("TimeoutCheck", "tc2").await.unwrap()).is_false();

        // given: holder never releases
        tokio::time::sleep(lease + Duration::from_secs(2)).await;

        // then: lease expiry frees it
        assert_that!(locker.try_acquire("TimeoutCheck", "tc2", lease).await.unwrap()).is_true();
        assert_that!(locker.release("TimeoutCheck", "tc2").await.unwrap()).is_true();
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_etcd_locker_extends_one_lease() {
        let etcd = etcd_container();
        let uri = etcd.uri();
        let locker = EtcdDistributedLocker::connect(&uri).await.unwrap();
        let mut client = EtcdHelper::connect(&uri).await.unwrap();
        let lease = Duration::from_secs(2);

        // given: lock extended repeatedly past its lease
        for _ in 0..4 {
            assert_that!(locker.try_acquire("RetryCommitting", "tc1", lease).await.unwrap()).is_true();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        // then: it is still held on the one lease granted
        assert_that!(locker.try_acquire("RetryCommitting", "tc2", lease).await.unwrap()).is_false();
        let leases = client.leases().await.unwrap();
        assert_that!(leases.leases().len()).is_equal_to(1);

        // when: released
        assert_that!(locker.release("RetryCommitting", "tc1").await.unwrap()).is_true();

        // then: its lease is revoked
        let leases = client.leases().await.unwrap();
        assert_that!(leases.leases().is_empty()).is_true();
    }
}
