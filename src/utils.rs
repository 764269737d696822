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

use tokio::sync::watch;

/// Stops every linked [DropWatcher] once dropped.
#[derive(Debug)]
pub struct DropOwner {
    sender: watch::Sender<()>,
}

#[derive(Clone, Debug)]
pub struct DropWatcher {
    receiver: watch::Receiver<()>,
}

impl DropWatcher {
    /// Resolves after the owner is gone.
    pub async fn dropped(&mut self) {
        while self.receiver.changed().await.is_ok() {}
    }

    pub fn is_dropped(&self) -> bool {
        self.receiver.has_changed().is_err()
    }
}

impl DropOwner {
    pub fn watch(&self) -> DropWatcher {
        DropWatcher { receiver: self.sender.subscribe() }
    }
}

pub fn drop_watcher() -> (DropOwner, DropWatcher) {
    let (sender, receiver) = watch::channel(());
    (DropOwner { sender }, DropWatcher { receiver })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assertor::*;

    use super::*;

    #[tokio::test]
    async fn test_drop_watcher() {
        let (owner, mut watcher) = drop_watcher();
        let cloned = owner.watch();
        assert_that!(cloned.is_dropped()).is_false();

        let pending = tokio::time::timeout(Duration::from_millis(10), watcher.dropped()).await;
        assert_that!(pending.is_err()).is_true();

        drop(owner);
        watcher.dropped().await;
        assert_that!(cloned.is_dropped()).is_true();
    }
}
