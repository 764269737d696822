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

use super::StoreError;
use crate::clock::millis_of;
use crate::session::{BranchHandling, BranchSession, BranchStatus, BranchType, GlobalSession, GlobalStatus};

/// Persisted form of [GlobalSession] with its branches embedded.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GlobalSessionRecord {
    #[prost(string, tag = "1")]
    pub xid: String,
    #[prost(uint64, tag = "2")]
    pub transaction_id: u64,
    #[prost(string, tag = "3")]
    pub application_id: String,
    #[prost(string, tag = "4")]
    pub transaction_service_group: String,
    #[prost(string, tag = "5")]
    pub transaction_name: String,
    #[prost(int32, tag = "6")]
    pub status: i32,
    #[prost(uint64, tag = "7")]
    pub timeout_millis: u64,
    #[prost(uint64, tag = "8")]
    pub begin_time: u64,
    #[prost(uint64, tag = "9")]
    pub gmt_updated: u64,
    #[prost(string, tag = "10")]
    pub application_data: String,
    #[prost(message, repeated, tag = "11")]
    pub branches: Vec<BranchSessionRecord>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BranchSessionRecord {
    #[prost(uint64, tag = "1")]
    pub branch_id: u64,
    #[prost(string, tag = "2")]
    pub resource_group_id: String,
    #[prost(string, tag = "3")]
    pub resource_id: String,
    #[prost(string, tag = "4")]
    pub client_id: String,
    #[prost(int32, tag = "5")]
    pub branch_type: i32,
    #[prost(int32, tag = "6")]
    pub status: i32,
    #[prost(string, tag = "7")]
    pub lock_key: String,
    #[prost(string, tag = "8")]
    pub application_data: String,
    #[prost(uint64, tag = "9")]
    pub begin_time: u64,
}

impl From<&BranchSession> for BranchSessionRecord {
    fn from(branch: &BranchSession) -> Self {
        Self {
            branch_id: branch.branch_id,
            resource_group_id: branch.resource_group_id.clone(),
            resource_id: branch.resource_id.clone(),
            client_id: branch.client_id.clone(),
            branch_type: branch.branch_type.code(),
            status: branch.status.code(),
            lock_key: branch.lock_key.clone(),
            application_data: branch.application_data.clone(),
            begin_time: branch.begin_time,
        }
    }
}

impl From<&GlobalSession> for GlobalSessionRecord {
    fn from(session: &GlobalSession) -> Self {
        Self {
            xid: session.xid.clone(),
            transaction_id: session.transaction_id,
            application_id: session.application_id.clone(),
            transaction_service_group: session.transaction_service_group.clone(),
            transaction_name: session.transaction_name.clone(),
            status: session.status.code(),
            timeout_millis: millis_of(session.timeout),
            begin_time: session.begin_time,
            gmt_updated: session.gmt_updated,
            application_data: session.application_data.clone(),
            branches: session.branches().iter().map(BranchSessionRecord::from).collect(),
        }
    }
}

impl BranchSessionRecord {
    fn into_branch(self, xid: &str, transaction_id: u64) -> Result<BranchSession, StoreError> {
        let branch_type = BranchType::from_code(self.branch_type).ok_or_else(|| {
            StoreError::corrupted(format!("branch {} of {xid} has unknown type {}", self.branch_id, self.branch_type))
        })?;
        let status = BranchStatus::from_code(self.status).ok_or_else(|| {
            StoreError::corrupted(format!("branch {} of {xid} has unknown status {}", self.branch_id, self.status))
        })?;
        Ok(BranchSession {
            xid: xid.to_string(),
            transaction_id,
            branch_id: self.branch_id,
            resource_group_id: self.resource_group_id,
            resource_id: self.resource_id,
            client_id: self.client_id,
            branch_type,
            status,
            lock_key: self.lock_key,
            application_data: self.application_data,
            begin_time: self.begin_time,
        })
    }
}

impl TryFrom<GlobalSessionRecord> for GlobalSession {
    type Error = StoreError;

    fn try_from(record: GlobalSessionRecord) -> Result<Self, Self::Error> {
        let status = GlobalStatus::from_code(record.status)
            .ok_or_else(|| StoreError::corrupted(format!("{} has unknown status {}", record.xid, record.status)))?;
        let branches = record
            .branches
            .into_iter()
            .map(|branch| branch.into_branch(&record.xid, record.transaction_id))
            .collect::<Result<Vec<_>, _>>()?;
        let mut session = GlobalSession::new(
            record.xid,
            record.transaction_id,
            record.application_id,
            record.transaction_service_group,
            record.transaction_name,
            Duration::from_millis(record.timeout_millis),
            record.begin_time,
        )
        .with_branches(branches);
        session.status = status;
        session.gmt_updated = record.gmt_updated;
        session.application_data = record.application_data;
        Ok(session)
    }
}
