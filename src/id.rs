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

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};

use crate::clock::Clock;

/// 2020-05-03T00:00:00+08:00.
pub const ID_EPOCH_MILLIS: u64 = 1588435200000;

const NODE_ID_BITS: u32 = 10;
const TIMESTAMP_BITS: u32 = 41;
const SEQUENCE_BITS: u32 = 12;

pub const MAX_NODE_ID: u16 = (1 << NODE_ID_BITS) - 1;

const TIMESTAMP_AND_SEQUENCE_MASK: u64 = (1 << (TIMESTAMP_BITS + SEQUENCE_BITS)) - 1;

/// Generates transaction and branch ids unique across coordinator nodes.
///
/// Layout from high to low: node id (10 bits), milliseconds since [ID_EPOCH_MILLIS] (41 bits),
/// sequence (12 bits). Timestamp and sequence share one counter that is seeded from the clock
/// once, so sequence overflow borrows from future milliseconds instead of blocking.
#[derive(Debug)]
pub struct IdGenerator {
    node_bits: u64,
    timestamp_and_sequence: AtomicU64,
}

impl IdGenerator {
    pub fn new(node_id: u16, clock: &Clock) -> Result<Self> {
        if node_id > MAX_NODE_ID {
            bail!("node id {node_id} exceeds max {MAX_NODE_ID}")
        }
        let elapsed = clock.now().saturating_sub(ID_EPOCH_MILLIS);
        let node_bits = (node_id as u64) << (TIMESTAMP_BITS + SEQUENCE_BITS);
        let timestamp_and_sequence = AtomicU64::new((elapsed << SEQUENCE_BITS) & TIMESTAMP_AND_SEQUENCE_MASK);
        Ok(Self { node_bits, timestamp_and_sequence })
    }

    pub fn next_id(&self) -> u64 {
        let next = self.timestamp_and_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.node_bits | (next & TIMESTAMP_AND_SEQUENCE_MASK)
    }

    pub fn node_id_of(id: u64) -> u16 {
        (id >> (TIMESTAMP_BITS + SEQUENCE_BITS)) as u16
    }
}

/// Formats xid as `{address}:{transaction_id}`.
pub fn format_xid(address: &str, transaction_id: u64) -> String {
    format!("{address}:{transaction_id}")
}

pub fn parse_transaction_id(xid: &str) -> Option<u64> {
    let (_address, id) = xid.rsplit_once(':')?;
    id.parse().ok()
}
