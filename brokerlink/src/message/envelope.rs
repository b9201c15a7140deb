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

use std::fmt;
use std::sync::{Arc, Weak};

use rand::Rng;
use tracing::{trace, warn};

use crate::proxy::{ListenerInner, ProxyError};
use crate::transport::MessageFrame;

/// One delivered, not-yet-settled message.
///
/// Envelopes are created by a [`ListenerProxy`](crate::proxy::ListenerProxy)
/// the moment a message arrives and are immutable afterwards. Settling one is a
/// two-step, consuming sequence: [`acquire`](Self::acquire) opens the scope
/// (beginning a transaction when the envelope is transactional) and
/// [`AcquiredMessage::complete`] closes it with exactly one terminal action.
/// Because both steps take `self`, an envelope cannot be settled twice.
pub struct MessageEnvelope {
    proxy: Weak<ListenerInner>,
    conn_id: String,
    sub_id: String,
    msg_id: String,
    ack_id: String,
    body: String,
    redelivered: bool,
    transactional: bool,
}

impl MessageEnvelope {
    pub(crate) fn from_frame(
        proxy: Weak<ListenerInner>,
        conn_id: &str,
        sub_id: &str,
        msg_id: &str,
        frame: MessageFrame,
        transactional: bool,
    ) -> Self {
        let ack_id = frame.ack_id().unwrap_or(msg_id).to_string();
        let redelivered = frame.header("redelivered") == Some("true");
        Self {
            proxy,
            conn_id: conn_id.to_string(),
            sub_id: sub_id.to_string(),
            msg_id: msg_id.to_string(),
            ack_id,
            body: frame.body,
            redelivered,
            transactional,
        }
    }

    /// Connection that delivered the message (`fqdn:port`).
    pub fn connection_id(&self) -> &str {
        &self.conn_id
    }

    /// Subscription the message arrived on.
    pub fn subscription_id(&self) -> &str {
        &self.sub_id
    }

    /// Broker message id.
    pub fn message_id(&self) -> &str {
        &self.msg_id
    }

    /// Id used to acknowledge the message.
    pub fn ack_id(&self) -> &str {
        &self.ack_id
    }

    /// Message payload.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Whether the broker flagged this as a redelivery.
    pub const fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    /// Whether settling happens inside a broker transaction.
    pub const fn is_transactional(&self) -> bool {
        self.transactional
    }

    /// Opens the processing scope.
    ///
    /// For a transactional envelope this begins a transaction on the
    /// delivering connection.
    ///
    /// # Errors
    ///
    /// Fails when the owning proxy is gone or the transaction cannot be started.
    /// The message then stays unacknowledged and the broker redelivers it.
    pub async fn acquire(self) -> Result<AcquiredMessage, ProxyError> {
        let transaction = if self.transactional {
            let proxy = self.proxy()?;
            let transaction = format!(
                "tx-{}-{:08x}",
                self.msg_id,
                rand::rng().random::<u32>()
            );
            proxy.begin(&self.conn_id, &transaction).await?;
            trace!(msg_id = %self.msg_id, %transaction, "transaction begun");
            Some(transaction)
        } else {
            None
        };
        Ok(AcquiredMessage {
            envelope: self,
            transaction,
            completed: false,
        })
    }

    fn proxy(&self) -> Result<Arc<ListenerInner>, ProxyError> {
        self.proxy
            .upgrade()
            .ok_or_else(|| ProxyError::ProxyGone(self.msg_id.clone()))
    }
}

impl fmt::Debug for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEnvelope")
            .field("conn_id", &self.conn_id)
            .field("sub_id", &self.sub_id)
            .field("msg_id", &self.msg_id)
            .field("ack_id", &self.ack_id)
            .field("transactional", &self.transactional)
            .finish_non_exhaustive()
    }
}

/// An envelope inside its processing scope.
///
/// Call [`complete`](Self::complete) exactly once. Dropping it instead sends
/// nothing to the broker; the message stays unacknowledged until the broker
/// redelivers it, and a warning is logged.
#[must_use = "an acquired message must be completed"]
pub struct AcquiredMessage {
    envelope: MessageEnvelope,
    transaction: Option<String>,
    completed: bool,
}

impl AcquiredMessage {
    /// The envelope being processed.
    pub const fn message(&self) -> &MessageEnvelope {
        &self.envelope
    }

    /// Transaction opened by [`MessageEnvelope::acquire`], if any.
    pub fn transaction(&self) -> Option<&str> {
        self.transaction.as_deref()
    }

    /// Closes the scope.
    ///
    /// On success: acknowledge, then commit when transactional. On failure:
    /// abort when transactional, otherwise reject; a bounded redelivery policy
    /// may dead-letter the message instead.
    ///
    /// # Errors
    ///
    /// Broker errors are returned as-is, never retried.
    pub async fn complete(mut self, success: bool) -> Result<CompletionOutcome, ProxyError> {
        self.completed = true;
        let proxy = self.envelope.proxy()?;
        proxy
            .finish(&self.envelope, self.transaction.as_deref(), success)
            .await
    }
}

impl Drop for AcquiredMessage {
    fn drop(&mut self) {
        if !self.completed {
            warn!(
                msg_id = %self.envelope.msg_id,
                conn_id = %self.envelope.conn_id,
                "acquired message dropped without completion; leaving it to broker redelivery"
            );
        }
    }
}

impl fmt::Debug for AcquiredMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredMessage")
            .field("envelope", &self.envelope)
            .field("transaction", &self.transaction)
            .finish()
    }
}

/// The terminal action taken when an acquired message was completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CompletionOutcome {
    /// Acknowledged outside a transaction (or a no-op in `auto` mode).
    Acknowledged,
    /// Acknowledged and committed.
    Committed,
    /// Negatively acknowledged.
    Rejected,
    /// Transaction aborted without acknowledging.
    Aborted,
    /// Redelivery limit reached; forwarded (when configured) and acknowledged.
    DeadLettered,
}

impl CompletionOutcome {
    /// Whether the message was processed successfully.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Acknowledged | Self::Committed)
    }
}

impl fmt::Display for CompletionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acknowledged => write!(f, "acknowledged"),
            Self::Committed => write!(f, "committed"),
            Self::Rejected => write!(f, "rejected"),
            Self::Aborted => write!(f, "aborted"),
            Self::DeadLettered => write!(f, "dead-lettered"),
        }
    }
}
