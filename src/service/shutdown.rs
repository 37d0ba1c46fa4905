// Copyright 2025 The vephor Authors
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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Process-wide stop signal for the network workers.
///
/// The flag is what every worker loop polls; the broadcast wakes the loops that
/// are parked in a long wait (background connect, accept).
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: broadcast::Sender<()>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        ShutdownSignal {
            flag: Arc::new(AtomicBool::new(false)),
            notify,
        }
    }
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        // no receivers is fine, nobody is parked
        let _ = self.notify.send(());
    }
    pub fn subscribe(&self) -> Shutdown {
        Shutdown::new(self.notify.subscribe(), self.is_set())
    }
}

#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>, is_shutdown: bool) -> Shutdown {
        Shutdown {
            is_shutdown,
            notify,
        }
    }
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscriber_wakes_on_trigger() {
        let signal = ShutdownSignal::new();
        let mut shutdown = signal.subscribe();
        assert!(!shutdown.is_shutdown());

        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });
        tokio::time::timeout(Duration::from_secs(2), shutdown.recv())
            .await
            .expect("shutdown was not delivered");
        assert!(shutdown.is_shutdown());
        assert!(signal.is_set());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_flag() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let mut shutdown = signal.subscribe();
        // must not block: the flag was already raised
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
    }
}
