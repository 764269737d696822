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

pub mod clock;
pub mod coordinator;
pub mod etcd;
pub mod id;
pub mod lock;
pub mod locker;
pub mod remoting;
pub mod session;
pub mod store;
pub mod utils;

pub use self::coordinator::{
    Coordinator,
    CoordinatorConfig,
    CoordinatorEnv,
    CoordinatorError,
    RecoveryReport,
    ScanKind,
    Scheduler,
    SchedulerHandle,
};
pub use self::session::{BranchStatus, BranchType, GlobalStatus};
