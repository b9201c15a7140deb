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

//! Redelivery policy for messages whose processing keeps failing.
//!
//! Without a bound, a failing message is aborted or rejected every time and the
//! broker redelivers it forever. A bounded policy counts failures per message id
//! and, once the bound is reached, settles the message instead: it is forwarded
//! to a dead-letter destination (when one is configured) and acknowledged.
//!
//! # Example
//!
//! ```rust,ignore
//! use brokerlink::prelude::*;
//!
//! let policy = RedeliveryPolicy::bounded(5).with_dead_letter("/queue/dead");
//! let options = ListenerOptions::default().with_redelivery(policy);
//! ```

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// How many times a message may fail before it is taken off the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryPolicy {
    /// Deliveries allowed per message. `None` means unbounded.
    pub max_deliveries: Option<u32>,

    /// Where exhausted messages are forwarded before being acknowledged.
    ///
    /// When unset, exhausted messages are acknowledged and dropped.
    pub dead_letter_destination: Option<String>,
}

impl RedeliveryPolicy {
    /// Unbounded redelivery.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            max_deliveries: None,
            dead_letter_destination: None,
        }
    }

    /// At most `max_deliveries` deliveries per message.
    #[must_use]
    pub const fn bounded(max_deliveries: u32) -> Self {
        Self {
            max_deliveries: Some(max_deliveries),
            dead_letter_destination: None,
        }
    }

    /// Sets the dead-letter destination.
    #[must_use]
    pub fn with_dead_letter(mut self, destination: impl Into<String>) -> Self {
        self.dead_letter_destination = Some(destination.into());
        self
    }

    /// Whether failures are counted at all.
    #[must_use]
    pub const fn is_bounded(&self) -> bool {
        self.max_deliveries.is_some()
    }
}

/// What to do with a message whose processing just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliveryDecision {
    /// Abort or reject, letting the broker deliver it again.
    Redeliver,
    /// Stop redelivering: forward to the dead-letter destination (if any) and acknowledge.
    DeadLetter,
}

impl fmt::Display for RedeliveryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redeliver => write!(f, "redeliver"),
            Self::DeadLetter => write!(f, "dead-letter"),
        }
    }
}

/// Counts failed deliveries per message id for one listener proxy.
#[derive(Debug, Default)]
pub struct RedeliveryTracker {
    policy: RedeliveryPolicy,
    failures: DashMap<String, u32>,
}

impl RedeliveryTracker {
    /// Creates a tracker for `policy`.
    #[must_use]
    pub fn new(policy: RedeliveryPolicy) -> Self {
        Self {
            policy,
            failures: DashMap::new(),
        }
    }

    /// The policy in force.
    #[must_use]
    pub const fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    /// Records a failed delivery of `message_id` and decides its fate.
    ///
    /// The count is kept after a `DeadLetter` decision; the caller forgets
    /// the message once it has actually been taken off the queue.
    pub fn record_failure(&self, message_id: &str) -> RedeliveryDecision {
        let Some(max) = self.policy.max_deliveries else {
            return RedeliveryDecision::Redeliver;
        };
        let failures = {
            let mut entry = self.failures.entry(message_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if failures >= max {
            RedeliveryDecision::DeadLetter
        } else {
            RedeliveryDecision::Redeliver
        }
    }

    /// Forgets `message_id` once it was processed or dead-lettered.
    pub fn forget(&self, message_id: &str) {
        self.failures.remove(message_id);
    }

    /// Failures recorded so far for `message_id`.
    #[must_use]
    pub fn failures(&self, message_id: &str) -> u32 {
        self.failures.get(message_id).map_or(0, |entry| *entry)
    }

    /// Message ids currently being counted.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.failures.len()
    }
}
