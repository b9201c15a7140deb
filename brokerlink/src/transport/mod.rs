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

//! The seam between brokerlink and a STOMP-capable broker client.
//!
//! A [`Connector`] builds one [`BrokerConnection`] per resolved broker address.
//! Connection operations are async and may block on network I/O; they are
//! never called from inside a [`ConnectionListener`] callback, which runs on
//! the client's own delivery path and must stay fast.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::common::{AckMode, Credentials, TlsOptions};

pub use resolver::{
    build_connections, resolve_endpoints, AddressResolver, ConnectionMap, Endpoint, ResolveError,
    StaticResolver, SystemResolver,
};

mod resolver;
/// In-process broker implementing the transport traits.
pub mod memory;

/// Frame headers.
pub type Headers = BTreeMap<String, String>;

/// One frame received from the broker (`MESSAGE` or `ERROR`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFrame {
    /// Frame headers.
    pub headers: Headers,
    /// Frame body.
    pub body: String,
}

impl MessageFrame {
    /// Builds a frame from headers and body.
    pub fn new(headers: Headers, body: impl Into<String>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Looks up a header.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// The `message-id` header.
    pub fn message_id(&self) -> Option<&str> {
        self.header("message-id")
    }

    /// The id to acknowledge with: `ack` (STOMP 1.2), falling back to `message-id`.
    pub fn ack_id(&self) -> Option<&str> {
        self.header("ack").or_else(|| self.message_id())
    }
}

/// Everything sent on `CONNECT`.
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    /// Login, passcode and virtual host.
    pub credentials: Credentials,
    /// Extra headers, e.g. `client-id`.
    pub headers: Headers,
}

/// Callbacks invoked by a connection on its delivery path.
///
/// Implementations must return quickly and must not call back into
/// connection operations.
pub trait ConnectionListener: Send + Sync {
    /// A `MESSAGE` frame arrived.
    fn on_message(&self, frame: MessageFrame);
    /// An `ERROR` frame arrived.
    fn on_error(&self, frame: MessageFrame);
    /// The session ended, intentionally or not.
    fn on_disconnected(&self);
}

/// One broker session.
#[async_trait]
pub trait BrokerConnection: Send + Sync + fmt::Debug {
    /// Address this connection talks to.
    fn endpoint(&self) -> &Endpoint;

    /// Installs the callback object, replacing any previous one.
    fn set_listener(&self, listener: Arc<dyn ConnectionListener>);

    /// Whether the session is currently up.
    fn is_connected(&self) -> bool;

    /// Opens the session.
    async fn connect(&self, params: &ConnectParams) -> Result<(), TransportError>;

    /// Closes the session. Closing an already closed session is not an error.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Subscribes to `destination` under subscription `id`.
    async fn subscribe(
        &self,
        destination: &str,
        id: &str,
        ack: AckMode,
        headers: &Headers,
    ) -> Result<(), TransportError>;

    /// Drops subscription `id`.
    async fn unsubscribe(&self, id: &str) -> Result<(), TransportError>;

    /// Publishes `body` to `destination`.
    async fn send(
        &self,
        destination: &str,
        body: &str,
        headers: &Headers,
    ) -> Result<(), TransportError>;

    /// Acknowledges a message, optionally inside a transaction.
    async fn ack(&self, ack_id: &str, transaction: Option<&str>) -> Result<(), TransportError>;

    /// Rejects a message, optionally inside a transaction.
    async fn nack(&self, ack_id: &str, transaction: Option<&str>) -> Result<(), TransportError>;

    /// Starts transaction `transaction`.
    async fn begin(&self, transaction: &str) -> Result<(), TransportError>;

    /// Commits transaction `transaction`.
    async fn commit(&self, transaction: &str) -> Result<(), TransportError>;

    /// Aborts transaction `transaction`.
    async fn abort(&self, transaction: &str) -> Result<(), TransportError>;
}

/// Builds connections for resolved broker addresses.
pub trait Connector: Send + Sync {
    /// Creates an unconnected session to `endpoint`, configured with `tls`.
    ///
    /// # Errors
    ///
    /// Fails when the TLS material is unusable.
    fn connection(
        &self,
        endpoint: &Endpoint,
        tls: &TlsOptions,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

/// Errors raised by a transport.
#[derive(Debug)]
pub enum TransportError {
    /// The operation needs an open session.
    NotConnected(String),
    /// The broker rejected `CONNECT`.
    Refused {
        /// Broker address.
        endpoint: String,
        /// Reason reported by the broker.
        reason: String,
    },
    /// TLS material could not be used.
    Tls(String),
    /// The broker rejected a frame.
    Protocol(String),
    /// Socket or file error.
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected(endpoint) => write!(f, "not connected to {endpoint}"),
            Self::Refused { endpoint, reason } => {
                write!(f, "connection to {endpoint} refused: {reason}")
            }
            Self::Tls(e) => write!(f, "TLS error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
