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

use std::sync::Arc;
use std::time::Duration;

use assertor::*;
use test_case::test_case;

use super::*;
use crate::lock::{row_key, LockHolder};
use crate::locker::{DistributedLocker, MemoryDistributedLocker};
use crate::remoting::tests::{Action, Reply, ScriptedRemoting};
use crate::store::tests::{FlakySessionStore, GatedSessionStore};

const RESOURCE: &str = "jdbc:mysql://db/orders";
const CLIENT: &str = "order-service:10.0.0.8:51234";
const TIMEOUT: Duration = Duration::from_secs(60);

struct Fixture {
    coordinator: Coordinator,
    clock: Clock,
    store: Arc<FlakySessionStore>,
    locks: Arc<MemoryLockStore>,
    remoting: Arc<ScriptedRemoting>,
}

fn config() -> CoordinatorConfig {
    CoordinatorConfig::new(1, "10.0.0.1:8091").with_branch_timeout(Duration::from_millis(100))
}

impl Fixture {
    fn new(config: CoordinatorConfig) -> Self {
        let store = Arc::new(FlakySessionStore::new(Arc::new(MemorySessionStore::new())));
        Self::with_store(config, store)
    }

    fn with_store(config: CoordinatorConfig, store: Arc<FlakySessionStore>) -> Self {
        let clock = Clock::manual(1_700_000_000_000);
        let locks = Arc::new(MemoryLockStore::new());
        let remoting = Arc::new(ScriptedRemoting::new());
        let env =
            CoordinatorEnv::new(store.clone(), locks.clone(), remoting.clone()).with_clock(clock.clone());
        let coordinator = Coordinator::new(config, env).unwrap();
        Self { coordinator, clock, store, locks, remoting }
    }

    async fn begin(&self) -> String {
        self.coordinator.begin("order-service", "default_tx_group", "place-order", TIMEOUT).await.unwrap()
    }

    async fn register(&self, xid: &str, lock_key: &str) -> u64 {
        self.coordinator.branch_register(BranchType::AT, RESOURCE, CLIENT, xid, "", lock_key).await.unwrap()
    }

    async fn status(&self, xid: &str) -> GlobalStatus {
        self.coordinator.get_status(xid).await.unwrap()
    }

    async fn owner(&self, table: &str, pk: &str) -> Option<LockHolder> {
        self.locks.query_owner(&row_key(RESOURCE, table, pk)).await.unwrap()
    }

    /// Another coordinator sharing row locks, participants and clock, storing through `store`.
    fn peer(&self, store: Arc<dyn SessionStore>) -> Coordinator {
        let config = CoordinatorConfig::new(2, "10.0.0.2:8091").with_branch_timeout(Duration::from_millis(100));
        let env = CoordinatorEnv::new(store, self.locks.clone(), self.remoting.clone()).with_clock(self.clock.clone());
        Coordinator::new(config, env).unwrap()
    }

    /// Moves a stored session into `status` as a crashed driver would have left it.
    async fn force_status(&self, xid: &str, status: GlobalStatus) {
        let mut session = self.store.find_global_session(xid).await.unwrap().unwrap();
        session.status = status;
        session.gmt_updated = self.clock.now();
        self.store.update_global_session(&session).await.unwrap();
    }
}

#[tokio::test]
async fn test_begin() {
    let fixture = Fixture::new(config());

    let xid = fixture.begin().await;
    assert_that!(xid.starts_with("10.0.0.1:8091:")).is_true();
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Begin);
    assert_that!(fixture.status("10.0.0.1:8091:404").await).is_equal_to(GlobalStatus::Finished);

    let other = fixture.begin().await;
    assert_that!(other).is_not_equal_to(xid);

    let err = fixture.coordinator.begin("order-service", "default_tx_group", "", Duration::ZERO).await.unwrap_err();
    assert_that!(matches!(err, CoordinatorError::InvalidArgument { .. })).is_true();
}

#[tokio::test]
async fn test_begin_store_failure() {
    let fixture = Fixture::new(config());
    fixture.store.fail_next_writes(1);

    let err = fixture.coordinator.begin("order-service", "default_tx_group", "", TIMEOUT).await.unwrap_err();
    assert_that!(matches!(err, CoordinatorError::BeginFailed { .. })).is_true();
    assert_that!(err.is_retryable()).is_true();
}

#[tokio::test]
async fn test_branch_register_lock_conflict() {
    let fixture = Fixture::new(config());
    let xid1 = fixture.begin().await;
    let xid2 = fixture.begin().await;

    let branch1 = fixture.register(&xid1, "tb:1,2").await;
    fixture.register(&xid2, "tb:3").await;

    let err = fixture
        .coordinator
        .branch_register(BranchType::AT, RESOURCE, CLIENT, &xid2, "", "tb:2,4")
        .await
        .unwrap_err();
    assert_that!(matches!(err, CoordinatorError::LockConflict { .. })).is_true();
    assert_that!(err.is_retryable()).is_true();

    // All or nothing.
    assert_that!(fixture.owner("tb", "4").await).is_equal_to(None);
    assert_that!(fixture.owner("tb", "2").await.unwrap().branch_id).is_equal_to(branch1);
    assert_that!(fixture.locks.len()).is_equal_to(3);

    assert_that!(fixture.coordinator.lock_query(BranchType::AT, RESOURCE, &xid2, "tb:1").await.unwrap()).is_false();
    assert_that!(fixture.coordinator.lock_query(BranchType::AT, RESOURCE, &xid1, "tb:1").await.unwrap()).is_true();
    assert_that!(fixture.coordinator.lock_query(BranchType::AT, RESOURCE, &xid2, "tb:5").await.unwrap()).is_true();
}

#[tokio::test]
async fn test_branch_register_reentrant() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;

    let branch1 = fixture.register(&xid, "tb:1").await;
    let branch2 = fixture.register(&xid, "tb:1,2").await;
    assert_that!(branch2).is_not_equal_to(branch1);
    assert_that!(fixture.owner("tb", "1").await.unwrap().branch_id).is_equal_to(branch1);
    assert_that!(fixture.owner("tb", "2").await.unwrap().branch_id).is_equal_to(branch2);
}

#[tokio::test]
async fn test_branch_register_invalid_lock_key() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;

    let err = fixture.coordinator.branch_register(BranchType::AT, RESOURCE, CLIENT, &xid, "", "tb").await.unwrap_err();
    assert_that!(matches!(err, CoordinatorError::InvalidArgument { .. })).is_true();

    let err = fixture.coordinator.branch_register(BranchType::AT, RESOURCE, CLIENT, "tc:404", "", "tb:1").await.unwrap_err();
    assert_that!(matches!(err, CoordinatorError::GlobalNotFound { .. })).is_true();
}

#[tokio::test]
async fn test_branch_register_store_failure_releases_locks() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    fixture.register(&xid, "tb:1").await;

    fixture.store.fail_next_writes(1);
    let err = fixture.coordinator.branch_register(BranchType::AT, RESOURCE, CLIENT, &xid, "", "tb:2").await.unwrap_err();
    assert_that!(matches!(err, CoordinatorError::Store(_))).is_true();
    assert_that!(err.is_retryable()).is_true();

    assert_that!(fixture.owner("tb", "2").await).is_equal_to(None);
    assert_that!(fixture.owner("tb", "1").await.is_some()).is_true();
    let session = fixture.store.find_global_session(&xid).await.unwrap().unwrap();
    assert_that!(session.branches().len()).is_equal_to(1);
}

#[tokio::test]
async fn test_branch_register_after_decision() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    let branch_id = fixture.register(&xid, "tb:1").await;
    fixture.force_status(&xid, GlobalStatus::Committing).await;

    // given: a resource manager retrying registration after commit started
    let repeated = fixture.register(&xid, "tb:1").await;
    assert_that!(repeated).is_equal_to(branch_id);

    // when: a new branch registers
    let err = fixture.coordinator.branch_register(BranchType::AT, RESOURCE, CLIENT, &xid, "", "tb:2").await.unwrap_err();

    // then: it is refused
    assert_that!(matches!(err, CoordinatorError::InvalidStatus { status: GlobalStatus::Committing, .. })).is_true();
}

#[test_log::test(tokio::test)]
async fn test_branch_register_racing_commit_on_peer() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    let branch_a = fixture.register(&xid, "tb:1").await;
    fixture.remoting.script(branch_a, [Reply::Status(BranchStatus::PhaseTwoCommitFailedRetryable)]);

    // given: peer registering a branch stalls before its store write
    let store = Arc::new(GatedSessionStore::new(fixture.store.clone(), "add_branch_session"));
    let peer = fixture.peer(store.clone());
    let register = tokio::spawn({
        let xid = xid.clone();
        async move { peer.branch_register(BranchType::AT, RESOURCE, CLIENT, &xid, "", "tb:2").await }
    });
    store.entered().await;
    assert_that!(fixture.owner("tb", "2").await.is_some()).is_true();

    // when: commit is decided meanwhile
    let status = fixture.coordinator.global_commit(&xid).await.unwrap();
    assert_that!(status).is_equal_to(GlobalStatus::CommitRetrying);
    store.open();

    // then: late branch is refused without leaving its lock behind
    let err = register.await.unwrap().unwrap_err();
    assert_that!(matches!(err, CoordinatorError::InvalidStatus { status: GlobalStatus::CommitRetrying, .. })).is_true();
    assert_that!(fixture.owner("tb", "2").await).is_equal_to(None);
    let session = fixture.store.find_global_session(&xid).await.unwrap().unwrap();
    assert_that!(session.branch_ids()).is_equal_to(vec![branch_a]);

    assert_that!(fixture.coordinator.handle_retry_committing().await.unwrap()).is_equal_to(1);
    assert_that!(fixture.locks.is_empty()).is_true();
}

#[test_log::test(tokio::test)]
async fn test_global_commit_adopts_branch_registered_on_peer() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    let branch_a = fixture.register(&xid, "tb:1").await;

    // given: peer committing stalls before persisting its decision
    let store = Arc::new(GatedSessionStore::new(fixture.store.clone(), "update_global_session"));
    let peer = fixture.peer(store.clone());
    let commit = tokio::spawn({
        let xid = xid.clone();
        async move { peer.global_commit(&xid).await }
    });
    store.entered().await;

    // when: a branch registers meanwhile
    let branch_b = fixture.register(&xid, "tb:2").await;
    store.open();

    // then: commit drives both branches and releases all their locks
    assert_that!(commit.await.unwrap().unwrap()).is_equal_to(GlobalStatus::Committed);
    assert_that!(fixture.remoting.called_branches(Action::Commit)).is_equal_to(vec![branch_a, branch_b]);
    assert_that!(fixture.locks.is_empty()).is_true();
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);
}

async fn register_concurrently(fixture: &Fixture, lock_keys: Vec<String>) -> Vec<(String, Result<u64>)> {
    let mut xids = Vec::new();
    for _ in 0..lock_keys.len() {
        xids.push(fixture.begin().await);
    }
    let mut registers = Vec::new();
    for (xid, lock_key) in xids.into_iter().zip(lock_keys) {
        let coordinator = fixture.coordinator.clone();
        let register = tokio::spawn({
            let xid = xid.clone();
            async move { coordinator.branch_register(BranchType::AT, RESOURCE, CLIENT, &xid, "", &lock_key).await }
        });
        registers.push((xid, register));
    }
    let mut results = Vec::new();
    for (xid, register) in registers {
        results.push((xid, register.await.unwrap()));
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_branch_register_concurrently_on_shared_row() {
    let fixture = Fixture::new(config());

    // given: transactions racing for one shared row
    let lock_keys = (0..16).map(|i| format!("tb:{i},shared")).collect();
    let results = register_concurrently(&fixture, lock_keys).await;

    // then: exactly one wins and losers lock nothing
    let mut winners = Vec::new();
    for (xid, result) in results {
        match result {
            Ok(branch_id) => winners.push((xid, branch_id)),
            Err(err) => assert_that!(matches!(err, CoordinatorError::LockConflict { .. })).is_true(),
        }
    }
    assert_that!(winners.len()).is_equal_to(1);
    let (xid, branch_id) = &winners[0];
    let holder = fixture.owner("tb", "shared").await.unwrap();
    assert_that!(holder.xid).is_equal_to(xid.clone());
    assert_that!(holder.branch_id).is_equal_to(*branch_id);
    assert_that!(fixture.locks.len()).is_equal_to(2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_branch_register_concurrently_on_disjoint_rows() {
    let fixture = Fixture::new(config());

    let lock_keys = (0..16).map(|i| format!("tb:{i};tc:{i}")).collect();
    let results = register_concurrently(&fixture, lock_keys).await;

    for (_xid, result) in results {
        assert_that!(result.is_ok()).is_true();
    }
    assert_that!(fixture.locks.len()).is_equal_to(32);
}

#[test_log::test(tokio::test)]
async fn test_global_commit_in_registration_order() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    let branch_a = fixture.register(&xid, "tb:1").await;
    let branch_b = fixture.register(&xid, "tb:2").await;
    let branch_c = fixture.register(&xid, "tb:3").await;

    let status = fixture.coordinator.global_commit(&xid).await.unwrap();
    assert_that!(status).is_equal_to(GlobalStatus::Committed);
    assert_that!(fixture.remoting.called_branches(Action::Commit)).is_equal_to(vec![branch_a, branch_b, branch_c]);
    assert_that!(fixture.locks.is_empty()).is_true();
    assert_that!(fixture.store.find_global_session(&xid).await.unwrap()).is_equal_to(None);
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);

    // Commit of a finished transaction is idempotent.
    assert_that!(fixture.coordinator.global_commit(&xid).await.unwrap()).is_equal_to(GlobalStatus::Finished);
    assert_that!(fixture.remoting.calls()).has_length(3);
}

#[test_log::test(tokio::test)]
async fn test_global_rollback_in_reverse_order() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    let branch_a = fixture.register(&xid, "tb:1").await;
    let branch_b = fixture.register(&xid, "tb:2").await;
    let branch_c = fixture.register(&xid, "tb:3").await;

    let status = fixture.coordinator.global_rollback(&xid).await.unwrap();
    assert_that!(status).is_equal_to(GlobalStatus::Rollbacked);
    assert_that!(fixture.remoting.called_branches(Action::Rollback)).is_equal_to(vec![branch_c, branch_b, branch_a]);
    assert_that!(fixture.locks.is_empty()).is_true();
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);
}

#[test_case(Reply::Status(BranchStatus::PhaseTwoCommitFailedRetryable); "retryable")]
#[test_case(Reply::Unreachable; "unreachable")]
#[test_case(Reply::Hang; "timeout")]
#[test_log::test(tokio::test)]
async fn test_global_commit_retry(reply: Reply) {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    let branch_a = fixture.register(&xid, "tb:1").await;
    let branch_b = fixture.register(&xid, "tb:2").await;

    // given: second branch failed retryably
    fixture.remoting.script(branch_b, [reply]);
    let status = fixture.coordinator.global_commit(&xid).await.unwrap();
    assert_that!(status).is_equal_to(GlobalStatus::CommitRetrying);
    assert_that!(fixture.owner("tb", "1").await).is_equal_to(None);
    assert_that!(fixture.owner("tb", "2").await.unwrap().branch_id).is_equal_to(branch_b);
    let session = fixture.store.find_global_session(&xid).await.unwrap().unwrap();
    assert_that!(session.branch_ids()).is_equal_to(vec![branch_b]);

    // then: repeated commit reports progress without driving again
    assert_that!(fixture.coordinator.global_commit(&xid).await.unwrap()).is_equal_to(GlobalStatus::CommitRetrying);
    assert_that!(fixture.remoting.calls()).has_length(2);
    let err = fixture.coordinator.global_rollback(&xid).await.unwrap_err();
    assert_that!(matches!(err, CoordinatorError::InvalidStatus { .. })).is_true();

    // when: retry scan runs
    assert_that!(fixture.coordinator.handle_retry_committing().await.unwrap()).is_equal_to(1);

    // then: it resumes from the failed branch
    assert_that!(fixture.remoting.called_branches(Action::Commit)).is_equal_to(vec![branch_a, branch_b, branch_b]);
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);
    assert_that!(fixture.locks.is_empty()).is_true();
}

#[test_log::test(tokio::test)]
async fn test_global_commit_unretryable() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    let branch_a = fixture.register(&xid, "tb:1").await;
    let branch_b = fixture.register(&xid, "tb:2").await;
    let branch_c = fixture.register(&xid, "tb:3").await;
    fixture.remoting.script(branch_b, [Reply::Status(BranchStatus::PhaseTwoCommitFailed)]);

    let status = fixture.coordinator.global_commit(&xid).await.unwrap();
    assert_that!(status).is_equal_to(GlobalStatus::CommitFailed);
    assert_that!(fixture.remoting.called_branches(Action::Commit)).is_equal_to(vec![branch_a, branch_b]);

    // Failed sessions are kept for operators.
    let session = fixture.store.find_global_session(&xid).await.unwrap().unwrap();
    assert_that!(session.status).is_equal_to(GlobalStatus::CommitFailed);
    assert_that!(session.branch_ids()).is_equal_to(vec![branch_b, branch_c]);
    assert_that!(session.find_branch(branch_b).unwrap().status).is_equal_to(BranchStatus::PhaseTwoCommitFailed);
    assert_that!(fixture.owner("tb", "3").await.is_some()).is_true();
    assert_that!(fixture.coordinator.handle_retry_committing().await.unwrap()).is_equal_to(0);
}

#[tokio::test]
async fn test_global_commit_store_failure() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    fixture.register(&xid, "tb:1").await;

    fixture.store.fail_next_writes(1);
    let err = fixture.coordinator.global_commit(&xid).await.unwrap_err();
    assert_that!(err.is_retryable()).is_true();
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Begin);
    assert_that!(fixture.owner("tb", "1").await.is_some()).is_true();
    assert_that!(fixture.remoting.calls()).is_empty();

    assert_that!(fixture.coordinator.global_commit(&xid).await.unwrap()).is_equal_to(GlobalStatus::Committed);
}

#[tokio::test]
async fn test_global_rollback_store_failure_midway() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    let branch_a = fixture.register(&xid, "tb:1").await;
    let branch_b = fixture.register(&xid, "tb:2").await;
    fixture.force_status(&xid, GlobalStatus::Rollbacking).await;
    fixture.clock.advance(Duration::from_secs(11));

    // given: store rejects removal of the first rollbacked branch
    fixture.store.fail_next_writes(1);
    assert_that!(fixture.coordinator.handle_retry_rollbacking().await.unwrap()).is_equal_to(0);

    // then: nothing persisted is lost, next scan finishes
    let session = fixture.store.find_global_session(&xid).await.unwrap().unwrap();
    assert_that!(session.branch_ids()).is_equal_to(vec![branch_a, branch_b]);
    assert_that!(fixture.coordinator.handle_retry_rollbacking().await.unwrap()).is_equal_to(1);
    assert_that!(fixture.remoting.called_branches(Action::Rollback)).is_equal_to(vec![branch_b, branch_b, branch_a]);
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);
}

#[test_log::test(tokio::test)]
async fn test_async_commit() {
    let fixture = Fixture::new(config().with_async_commit(true));
    let xid = fixture.begin().await;
    let branch_id = fixture.register(&xid, "tb:1").await;

    let status = fixture.coordinator.global_commit(&xid).await.unwrap();
    assert_that!(status).is_equal_to(GlobalStatus::Committed);
    assert_that!(fixture.locks.is_empty()).is_true();
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::AsyncCommitting);
    assert_that!(fixture.remoting.calls()).is_empty();

    assert_that!(fixture.coordinator.handle_async_committing().await.unwrap()).is_equal_to(1);
    assert_that!(fixture.remoting.called_branches(Action::Commit)).is_equal_to(vec![branch_id]);
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);
}

#[tokio::test]
async fn test_async_commit_requires_async_branches() {
    let fixture = Fixture::new(config().with_async_commit(true));
    let xid = fixture.begin().await;
    fixture.register(&xid, "tb:1").await;
    fixture.coordinator.branch_register(BranchType::TCC, "tcc-inventory", CLIENT, &xid, "", "").await.unwrap();

    let status = fixture.coordinator.global_commit(&xid).await.unwrap();
    assert_that!(status).is_equal_to(GlobalStatus::Committed);
    assert_that!(fixture.remoting.called_branches(Action::Commit)).has_length(2);
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);
}

#[tokio::test]
async fn test_branch_report() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    let branch_a = fixture.register(&xid, "tb:1").await;
    let branch_b = fixture.register(&xid, "tb:2").await;

    fixture.coordinator.branch_report(&xid, branch_a, BranchStatus::PhaseOneFailed, Some("failed")).await.unwrap();
    let session = fixture.store.find_global_session(&xid).await.unwrap().unwrap();
    let branch = session.find_branch(branch_a).unwrap();
    assert_that!(branch.status).is_equal_to(BranchStatus::PhaseOneFailed);
    assert_that!(branch.application_data.as_str()).is_equal_to("failed");

    let err = fixture.coordinator.branch_report(&xid, 404, BranchStatus::PhaseOneDone, None).await.unwrap_err();
    assert_that!(matches!(err, CoordinatorError::BranchNotFound { branch_id: 404, .. })).is_true();

    // Phase one failed branches have nothing to commit.
    fixture.coordinator.global_commit(&xid).await.unwrap();
    assert_that!(fixture.remoting.called_branches(Action::Commit)).is_equal_to(vec![branch_b]);
    assert_that!(fixture.locks.is_empty()).is_true();
}

#[tokio::test]
async fn test_branch_report_xa_phase_two_refused() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    let branch_id =
        fixture.coordinator.branch_register(BranchType::XA, "xa-db", CLIENT, &xid, "", "").await.unwrap();

    fixture.coordinator.branch_report(&xid, branch_id, BranchStatus::PhaseOneDone, None).await.unwrap();
    let err =
        fixture.coordinator.branch_report(&xid, branch_id, BranchStatus::PhaseTwoCommitted, None).await.unwrap_err();
    assert_that!(matches!(err, CoordinatorError::InvalidArgument { .. })).is_true();
}

#[tokio::test]
async fn test_global_report() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    fixture.coordinator.branch_register(BranchType::SAGA, "saga-orders", CLIENT, &xid, "", "").await.unwrap();

    let status = fixture.coordinator.global_report(&xid, GlobalStatus::CommitRetrying).await.unwrap();
    assert_that!(status).is_equal_to(GlobalStatus::CommitRetrying);
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::CommitRetrying);

    fixture.coordinator.global_report(&xid, GlobalStatus::Committed).await.unwrap();
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);

    let xid = fixture.begin().await;
    fixture.register(&xid, "tb:1").await;
    let err = fixture.coordinator.global_report(&xid, GlobalStatus::Committed).await.unwrap_err();
    assert_that!(matches!(err, CoordinatorError::InvalidStatus { .. })).is_true();
}

#[tokio::test]
async fn test_lock_query_lockless_branch_type() {
    let fixture = Fixture::new(config());
    let err = fixture.coordinator.lock_query(BranchType::TCC, RESOURCE, "tc:1", "tb:1").await.unwrap_err();
    assert_that!(matches!(err, CoordinatorError::InvalidArgument { .. })).is_true();
}

#[test_case(Duration::ZERO, GlobalStatus::TimeoutRollbackRetrying; "timeout rollback")]
#[test_case(Duration::from_secs(10), GlobalStatus::RollbackRetrying; "within grace")]
#[test_log::test(tokio::test)]
async fn test_timeout_check(grace: Duration, retrying: GlobalStatus) {
    let fixture = Fixture::new(config().with_timeout_rollback_grace(grace));
    let xid = fixture.coordinator.begin("order-service", "default_tx_group", "", Duration::from_secs(1)).await.unwrap();
    let branch_id = fixture.register(&xid, "tb:1").await;
    fixture.remoting.script(branch_id, [Reply::Status(BranchStatus::PhaseTwoRollbackFailedRetryable)]);

    assert_that!(fixture.coordinator.timeout_check().await.unwrap()).is_equal_to(0);

    fixture.clock.advance(Duration::from_secs(2));
    assert_that!(fixture.coordinator.timeout_check().await.unwrap()).is_equal_to(1);
    assert_that!(fixture.status(&xid).await).is_equal_to(retrying);
    assert_that!(fixture.owner("tb", "1").await.is_some()).is_true();

    assert_that!(fixture.coordinator.handle_retry_rollbacking().await.unwrap()).is_equal_to(1);
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);
    assert_that!(fixture.locks.is_empty()).is_true();
}

#[test_log::test(tokio::test)]
async fn test_commit_retry_timeout() {
    let fixture = Fixture::new(config().with_max_commit_retry_timeout(Some(Duration::from_secs(5))));
    let xid = fixture.begin().await;
    let branch_id = fixture.register(&xid, "tb:1").await;
    fixture.remoting.script(branch_id, [Reply::Status(BranchStatus::PhaseTwoCommitFailedRetryable)]);
    assert_that!(fixture.coordinator.global_commit(&xid).await.unwrap()).is_equal_to(GlobalStatus::CommitRetrying);

    fixture.clock.advance(Duration::from_secs(6));
    assert_that!(fixture.coordinator.handle_retry_committing().await.unwrap()).is_equal_to(1);
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::CommitRetryTimeout);
    assert_that!(fixture.remoting.calls()).has_length(1);
}

#[test_log::test(tokio::test)]
#[tracing_test::traced_test]
async fn test_rollback_retry_timeout_unlock() {
    let config = config()
        .with_max_rollback_retry_timeout(Some(Duration::from_secs(5)))
        .with_rollback_retry_timeout_unlock(true);
    let fixture = Fixture::new(config);
    let xid = fixture.begin().await;
    let branch_id = fixture.register(&xid, "tb:1").await;
    let retryable = Reply::Status(BranchStatus::PhaseTwoRollbackFailedRetryable);
    fixture.remoting.script(branch_id, [retryable.clone(), retryable.clone(), retryable]);
    assert_that!(fixture.coordinator.global_rollback(&xid).await.unwrap()).is_equal_to(GlobalStatus::RollbackRetrying);

    fixture.clock.advance(Duration::from_secs(6));
    assert_that!(fixture.coordinator.handle_retry_rollbacking().await.unwrap()).is_equal_to(1);

    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::RollbackRetryTimeout);
    assert_that!(fixture.locks.is_empty()).is_true();
    assert!(logs_contain("row locks released"));

    // Released rows are available to others while the session waits for operators.
    let other = fixture.begin().await;
    fixture.register(&other, "tb:1").await;
    assert_that!(fixture.coordinator.handle_retry_rollbacking().await.unwrap()).is_equal_to(0);
}

#[test_log::test(tokio::test)]
async fn test_rollback_retry_timeout_keep_locks() {
    let fixture = Fixture::new(config().with_max_rollback_retry_timeout(Some(Duration::from_secs(5))));
    let xid = fixture.begin().await;
    let branch_id = fixture.register(&xid, "tb:1").await;
    let retryable = Reply::Status(BranchStatus::PhaseTwoRollbackFailedRetryable);
    fixture.remoting.script(branch_id, [retryable.clone(), retryable]);
    assert_that!(fixture.coordinator.global_rollback(&xid).await.unwrap()).is_equal_to(GlobalStatus::RollbackRetrying);

    fixture.clock.advance(Duration::from_secs(6));
    assert_that!(fixture.coordinator.handle_retry_rollbacking().await.unwrap()).is_equal_to(1);

    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::RollbackRetrying);
    assert_that!(fixture.owner("tb", "1").await.unwrap().branch_id).is_equal_to(branch_id);
    let other = fixture.begin().await;
    let err = fixture.coordinator.branch_register(BranchType::AT, RESOURCE, CLIENT, &other, "", "tb:1").await.unwrap_err();
    assert_that!(matches!(err, CoordinatorError::LockConflict { .. })).is_true();

    // Unscripted replies succeed.
    assert_that!(fixture.coordinator.handle_retry_rollbacking().await.unwrap()).is_equal_to(1);
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);
}

#[tokio::test]
async fn test_orphaned_committing() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    let branch_id = fixture.register(&xid, "tb:1").await;
    fixture.force_status(&xid, GlobalStatus::Committing).await;

    // given: a committing session updated recently
    assert_that!(fixture.coordinator.handle_retry_committing().await.unwrap()).is_equal_to(0);

    // when: its driver stays silent for too long
    fixture.clock.advance(Duration::from_secs(11));

    // then: retry scan takes it over
    assert_that!(fixture.coordinator.handle_retry_committing().await.unwrap()).is_equal_to(1);
    assert_that!(fixture.remoting.called_branches(Action::Commit)).is_equal_to(vec![branch_id]);
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);
}

#[test_log::test(tokio::test)]
async fn test_recover() {
    let store = Arc::new(FlakySessionStore::new(Arc::new(MemorySessionStore::new())));
    let fixture = Fixture::with_store(config(), store.clone());
    let xid1 = fixture.begin().await;
    let branch1 = fixture.register(&xid1, "tb:1,2").await;
    let xid2 = fixture.begin().await;
    let branch2 = fixture.register(&xid2, "tb:3").await;
    fixture.remoting.script(branch2, [Reply::Status(BranchStatus::PhaseTwoCommitFailedRetryable)]);
    fixture.coordinator.global_commit(&xid2).await.unwrap();
    let branch3 = fixture.coordinator.branch_register(BranchType::TCC, "tcc-inventory", CLIENT, &xid1, "", "").await.unwrap();
    let stored = fixture.store.find_global_session(&xid1).await.unwrap().unwrap();
    drop(fixture);

    // given: a restarted coordinator with empty lock store
    let fixture = Fixture::with_store(config(), store);
    assert_that!(fixture.locks.is_empty()).is_true();

    // when: recovering
    let report = fixture.coordinator.recover().await.unwrap();

    // then: sessions are intact and locks are rebuilt from them
    let session = fixture.store.find_global_session(&xid1).await.unwrap().unwrap();
    assert_that!(session.branch_ids()).is_equal_to(vec![branch1, branch3]);
    assert_that!(session).is_equal_to(stored);
    assert_that!(report).is_equal_to(RecoveryReport { sessions: 2, branches: 3, lock_conflicts: 0 });
    assert_that!(fixture.owner("tb", "1").await.unwrap().branch_id).is_equal_to(branch1);
    assert_that!(fixture.owner("tb", "3").await.unwrap().branch_id).is_equal_to(branch2);
    assert_that!(fixture.status(&xid2).await).is_equal_to(GlobalStatus::CommitRetrying);

    // Recovery is repeatable.
    let report = fixture.coordinator.recover().await.unwrap();
    assert_that!(report.lock_conflicts).is_equal_to(0);

    assert_that!(fixture.coordinator.handle_retry_committing().await.unwrap()).is_equal_to(1);
    assert_that!(fixture.coordinator.global_rollback(&xid1).await.unwrap()).is_equal_to(GlobalStatus::Rollbacked);
    assert_that!(fixture.locks.is_empty()).is_true();
}

#[tokio::test]
async fn test_admin_invalid_status() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    fixture.register(&xid, "tb:1").await;

    let is_invalid_status = |result: Result<_>| matches!(result, Err(CoordinatorError::InvalidStatus { .. }));
    assert_that!(is_invalid_status(fixture.coordinator.delete_global_session(&xid).await)).is_true();
    assert_that!(is_invalid_status(fixture.coordinator.stop_global_retry(&xid).await.map(|_| ()))).is_true();
    assert_that!(is_invalid_status(fixture.coordinator.start_global_retry(&xid).await.map(|_| ()))).is_true();
    assert_that!(is_invalid_status(fixture.coordinator.change_global_status(&xid).await.map(|_| ()))).is_true();
    assert_that!(is_invalid_status(fixture.coordinator.send_commit_or_rollback(&xid).await.map(|_| ()))).is_true();
    assert_that!(is_invalid_status(fixture.coordinator.delete_branch(&xid, 1).await)).is_true();

    let err = fixture.coordinator.delete_global_session("tc:404").await.unwrap_err();
    assert_that!(matches!(err, CoordinatorError::GlobalNotFound { .. })).is_true();
    assert_that!(err.is_retryable()).is_false();

    // Nothing changed.
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Begin);
    assert_that!(fixture.remoting.calls()).is_empty();
}

#[test_log::test(tokio::test)]
async fn test_admin_stop_and_start_retry() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    let branch_id = fixture.register(&xid, "tb:1").await;
    fixture.remoting.script(branch_id, [Reply::Status(BranchStatus::PhaseTwoCommitFailedRetryable)]);
    fixture.coordinator.global_commit(&xid).await.unwrap();

    let status = fixture.coordinator.stop_global_retry(&xid).await.unwrap();
    assert_that!(status).is_equal_to(GlobalStatus::StopCommitOrCommitRetry);
    assert_that!(fixture.coordinator.handle_retry_committing().await.unwrap()).is_equal_to(0);

    let status = fixture.coordinator.start_global_retry(&xid).await.unwrap();
    assert_that!(status).is_equal_to(GlobalStatus::CommitRetrying);

    assert_that!(fixture.coordinator.send_commit_or_rollback(&xid).await.unwrap()).is_true();
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);
    assert_that!(fixture.locks.is_empty()).is_true();
}

#[tokio::test]
async fn test_admin_change_global_status() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    let branch_id = fixture.register(&xid, "tb:1").await;
    fixture.remoting.script(branch_id, [Reply::Status(BranchStatus::PhaseTwoRollbackFailed)]);
    assert_that!(fixture.coordinator.global_rollback(&xid).await.unwrap()).is_equal_to(GlobalStatus::RollbackFailed);

    let status = fixture.coordinator.change_global_status(&xid).await.unwrap();
    assert_that!(status).is_equal_to(GlobalStatus::RollbackRetrying);
    assert_that!(fixture.coordinator.handle_retry_rollbacking().await.unwrap()).is_equal_to(1);
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);
}

#[tokio::test]
async fn test_admin_delete_global_session() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    fixture.register(&xid, "tb:1").await;
    let branch_b = fixture.register(&xid, "tb:2").await;
    fixture.remoting.script(branch_b, [Reply::Status(BranchStatus::PhaseTwoCommitFailed), Reply::Deleted(false)]);
    assert_that!(fixture.coordinator.global_commit(&xid).await.unwrap()).is_equal_to(GlobalStatus::CommitFailed);

    // given: participant refuses deletion
    let err = fixture.coordinator.delete_global_session(&xid).await.unwrap_err();
    assert_that!(matches!(err, CoordinatorError::BranchDeleteFailed { branch_id, .. } if branch_id == branch_b))
        .is_true();
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Deleting);
    assert_that!(fixture.owner("tb", "2").await.is_some()).is_true();

    // when: deleting again
    fixture.coordinator.delete_global_session(&xid).await.unwrap();

    // then: branch data, locks and session are gone
    assert_that!(fixture.remoting.called_branches(Action::Delete)).is_equal_to(vec![branch_b, branch_b]);
    assert_that!(fixture.locks.is_empty()).is_true();
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);
}

#[tokio::test]
async fn test_admin_force_delete() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    let branch_a = fixture.register(&xid, "tb:1").await;
    fixture.register(&xid, "tb:2").await;

    fixture.coordinator.force_delete_branch(&xid, branch_a).await.unwrap();
    assert_that!(fixture.owner("tb", "1").await).is_equal_to(None);
    assert_that!(fixture.owner("tb", "2").await.is_some()).is_true();

    fixture.coordinator.force_delete_global_session(&xid).await.unwrap();
    assert_that!(fixture.locks.is_empty()).is_true();
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);
    assert_that!(fixture.remoting.calls()).is_empty();

    let err = fixture.coordinator.force_delete_global_session(&xid).await.unwrap_err();
    assert_that!(matches!(err, CoordinatorError::GlobalNotFound { .. })).is_true();
}

#[tokio::test]
async fn test_admin_delete_branch() {
    let fixture = Fixture::new(config());
    let xid = fixture.begin().await;
    let branch_a = fixture.register(&xid, "tb:1").await;
    let branch_b = fixture.register(&xid, "tb:2").await;
    fixture.remoting.script(branch_a, [Reply::Status(BranchStatus::PhaseTwoCommitFailedRetryable)]);
    fixture.coordinator.global_commit(&xid).await.unwrap();

    fixture.coordinator.delete_branch(&xid, branch_a).await.unwrap();
    let session = fixture.store.find_global_session(&xid).await.unwrap().unwrap();
    assert_that!(session.branch_ids()).is_equal_to(vec![branch_b]);
    assert_that!(fixture.owner("tb", "1").await).is_equal_to(None);

    let err = fixture.coordinator.delete_branch(&xid, branch_a).await.unwrap_err();
    assert_that!(matches!(err, CoordinatorError::BranchNotFound { .. })).is_true();
}

#[tokio::test]
async fn test_undo_log_delete() {
    let fixture = Fixture::new(config().with_undo_log_save_days(3));
    assert_that!(fixture.coordinator.scan(ScanKind::UndoLogDelete).await.unwrap()).is_equal_to(1);
    assert_that!(fixture.remoting.purges()).is_equal_to(vec![3]);
}

#[tokio::test]
async fn test_scheduler_run_once_guarded_by_locker() {
    let fixture = Fixture::new(config().with_scheduler_lock_owner("tc-1"));
    let locker = Arc::new(MemoryDistributedLocker::new(fixture.clock.clone()));
    let scheduler = Scheduler::new(fixture.coordinator.clone(), locker.clone());

    let name = ScanKind::UndoLogDelete.lock_name();
    assert_that!(locker.try_acquire(name, "tc-2", Duration::from_secs(60)).await.unwrap()).is_true();
    assert_that!(scheduler.run_once(ScanKind::UndoLogDelete).await.unwrap()).is_equal_to(None);
    assert_that!(fixture.remoting.purges()).is_empty();

    locker.release(name, "tc-2").await.unwrap();
    assert_that!(scheduler.run_once(ScanKind::UndoLogDelete).await.unwrap()).is_equal_to(Some(1));

    // Lock is released after each run.
    assert_that!(locker.try_acquire(name, "tc-2", Duration::from_secs(60)).await.unwrap()).is_true();
}

#[test_log::test(tokio::test)]
async fn test_scheduler_lock_held_through_long_scan() {
    let lease = Duration::from_millis(600);
    let config = CoordinatorConfig::new(1, "10.0.0.1:8091")
        .with_branch_timeout(Duration::from_secs(5))
        .with_scheduler_lock_lease(lease)
        .with_scheduler_lock_owner("tc-1");
    let fixture = Fixture::new(config);
    let locker = Arc::new(MemoryDistributedLocker::new(fixture.clock.clone()));
    let xid = fixture.begin().await;
    let branch_id = fixture.register(&xid, "tb:1").await;
    fixture.remoting.script(branch_id, [Reply::Status(BranchStatus::PhaseTwoCommitFailedRetryable), Reply::Hang]);
    assert_that!(fixture.coordinator.global_commit(&xid).await.unwrap()).is_equal_to(GlobalStatus::CommitRetrying);

    // given: a scan stuck in phase two
    let scheduler = Scheduler::new(fixture.coordinator.clone(), locker.clone());
    let scan = tokio::spawn(async move { scheduler.run_once(ScanKind::RetryCommitting).await });
    while fixture.remoting.calls().len() < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // when: it outlasts its lease
    for _ in 0..10 {
        fixture.clock.advance(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // then: the lock is still extended by the scanning node
    let peer = Scheduler::new(fixture.peer(fixture.store.clone()), locker.clone());
    assert_that!(peer.run_once(ScanKind::RetryCommitting).await.unwrap()).is_equal_to(None);
    assert_that!(fixture.remoting.called_branches(Action::Commit)).is_equal_to(vec![branch_id, branch_id]);

    // when: the lock is taken over anyway
    let name = ScanKind::RetryCommitting.lock_name();
    locker.release(name, "tc-1").await.unwrap();
    assert_that!(locker.try_acquire(name, "tc-2", lease).await.unwrap()).is_true();

    // then: the scan stops and leaves the new holder alone
    let err = scan.await.unwrap().unwrap_err();
    assert_that!(err.to_string()).contains("taken over");
    assert_that!(locker.release(name, "tc-2").await.unwrap()).is_true();
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::CommitRetrying);
}

#[test_log::test(tokio::test)]
async fn test_scheduler_start() {
    let config = config()
        .with_committing_retry_period(Duration::from_millis(10))
        .with_timeout_retry_period(Duration::from_millis(10));
    let fixture = Fixture::new(config);
    let locker = Arc::new(MemoryDistributedLocker::new(fixture.clock.clone()));
    let xid = fixture.begin().await;
    let branch_id = fixture.register(&xid, "tb:1").await;
    fixture.remoting.script(branch_id, [Reply::Status(BranchStatus::PhaseTwoCommitFailedRetryable)]);
    assert_that!(fixture.coordinator.global_commit(&xid).await.unwrap()).is_equal_to(GlobalStatus::CommitRetrying);

    let handle = Scheduler::new(fixture.coordinator.clone(), locker).start();
    for _ in 0..200 {
        if fixture.status(&xid).await == GlobalStatus::Finished {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Finished);
    drop(handle);

    // Stopped scans leave timed out sessions alone.
    let xid = fixture.coordinator.begin("order-service", "default_tx_group", "", Duration::from_secs(1)).await.unwrap();
    fixture.clock.advance(Duration::from_secs(2));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_that!(fixture.status(&xid).await).is_equal_to(GlobalStatus::Begin);
}
