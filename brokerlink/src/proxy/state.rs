/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use rand::Rng;
use serde::Serialize;

use crate::common::{local_hostname, SETTINGS};

/// Disconnect flags and restart counter of one proxy.
#[derive(Debug, Default)]
pub(crate) struct ProxyState {
    got_disconnected: AtomicBool,
    to_disconnect: AtomicBool,
    n_restart: AtomicU32,
}

impl ProxyState {
    pub(crate) fn got_disconnected(&self) -> bool {
        self.got_disconnected.load(Ordering::SeqCst)
    }

    pub(crate) fn to_disconnect(&self) -> bool {
        self.to_disconnect.load(Ordering::SeqCst)
    }

    pub(crate) fn restart_count(&self) -> u32 {
        self.n_restart.load(Ordering::SeqCst)
    }

    /// Disconnect callback fired.
    pub(crate) fn mark_disconnected(&self) {
        self.got_disconnected.store(true, Ordering::SeqCst);
    }

    /// Connecting failed; leave the proxy for the guard to restart.
    pub(crate) fn mark_dropped(&self) {
        self.to_disconnect.store(false, Ordering::SeqCst);
        self.got_disconnected.store(true, Ordering::SeqCst);
    }

    /// Must run before any connection is closed on purpose.
    pub(crate) fn begin_stop(&self) {
        self.to_disconnect.store(true, Ordering::SeqCst);
    }

    pub(crate) fn reset(&self) {
        self.to_disconnect.store(false, Ordering::SeqCst);
        self.got_disconnected.store(false, Ordering::SeqCst);
    }

    pub(crate) fn record_restart(&self) -> u32 {
        self.n_restart.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Subscription and client ids of one proxy.
#[derive(Debug, Clone)]
pub(crate) struct ProxyIdentity {
    pub(crate) sub_id: String,
    pub(crate) client_id: String,
}

impl ProxyIdentity {
    /// `{prefix}-{kind}_{host}_r{NNNNNN}`; the random suffix keeps several
    /// processes subscribing to one queue apart.
    pub(crate) fn generate(kind: &str) -> Self {
        let mut rng = rand::rng();
        let sub_id = format!(
            "{}-{}_{}_r{:06}",
            SETTINGS.proxy.subscription_prefix,
            kind,
            local_hostname(),
            rng.random_range(0..1_000_000)
        );
        let client_id = format!("client_{}_{:x}", sub_id, rng.random::<u32>());
        Self { sub_id, client_id }
    }
}

/// Point-in-time view of a proxy, for guards and monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyStatus {
    /// Logical name (usually the queue name).
    pub name: String,
    /// Broker destination.
    pub destination: String,
    /// An unexpected or intentional disconnect was observed.
    pub got_disconnected: bool,
    /// The proxy is being stopped on purpose.
    pub to_disconnect: bool,
    /// Restarts since construction.
    pub restarts: u32,
    /// Owned connection ids.
    pub connections: Vec<String>,
}
