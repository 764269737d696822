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
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use static_assertions::{assert_impl_all, assert_not_impl_any};

/// Milliseconds since unix epoch.
pub type Millis = u64;

/// Whole milliseconds of `duration`, saturated at [Millis::MAX].
pub fn millis_of(duration: Duration) -> Millis {
    Millis::try_from(duration.as_millis()).unwrap_or(Millis::MAX)
}

/// Wall clock shared by sessions, scanners and id generation.
///
/// Readings never go backward within one process, even if system time does.
#[derive(Clone)]
pub struct Clock {
    inner: Arc<ClockSource>,
}

enum ClockSource {
    System(SystemTimeClock),
    Manual(ManualClock),
}

impl Clock {
    pub fn new() -> Self {
        Self { inner: Arc::new(ClockSource::System(SystemTimeClock::new())) }
    }

    /// Clock that only moves when told to.
    pub fn manual(start: Millis) -> Self {
        Self { inner: Arc::new(ClockSource::Manual(ManualClock { now: AtomicU64::new(start) })) }
    }

    pub fn now(&self) -> Millis {
        match self.inner.as_ref() {
            ClockSource::System(clock) => clock.now(),
            ClockSource::Manual(clock) => clock.now.load(Ordering::SeqCst),
        }
    }

    /// Advances a manual clock. System clocks ignore this.
    pub fn advance(&self, duration: Duration) {
        if let ClockSource::Manual(clock) = self.inner.as_ref() {
            clock.now.fetch_add(millis_of(duration), Ordering::SeqCst);
        }
    }

    pub fn elapsed_since(&self, millis: Millis) -> Duration {
        Duration::from_millis(self.now().saturating_sub(millis))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.as_ref() {
            ClockSource::System(_) => f.write_str("Clock::System"),
            ClockSource::Manual(clock) => write!(f, "Clock::Manual({})", clock.now.load(Ordering::SeqCst)),
        }
    }
}

fn system_time_now() -> Millis {
    let elapsed = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
    millis_of(elapsed)
}

struct SystemTimeClock {
    mutex: spin::Mutex<Millis>,
}

struct ManualClock {
    now: AtomicU64,
}

assert_impl_all!(SystemTimeClock: Send, Sync);
assert_not_impl_any!(SystemTimeClock: Clone, Copy);

impl SystemTimeClock {
    fn new() -> Self {
        Self { mutex: spin::Mutex::new(system_time_now()) }
    }

    fn now(&self) -> Millis {
        let now = system_time_now();
        let mut cache = self.mutex.lock();
        if now > *cache {
            *cache = now;
        }
        *cache
    }
}
