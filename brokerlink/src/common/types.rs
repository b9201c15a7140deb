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

//! Small value types shared by the transport, proxy and agent layers.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How a consumer confirms processing of a message to the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    /// The broker considers a message consumed as soon as it is delivered.
    Auto,
    /// An acknowledgement covers the message and every earlier one on the subscription.
    Client,
    /// Each message is acknowledged on its own.
    #[default]
    ClientIndividual,
}

impl AckMode {
    /// The header value used on a STOMP `SUBSCRIBE` frame.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Client => "client",
            Self::ClientIndividual => "client-individual",
        }
    }

    /// Whether the client must send `ACK`/`NACK` frames in this mode.
    #[must_use]
    pub const fn requires_ack(self) -> bool {
        !matches!(self, Self::Auto)
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the resolved broker addresses a proxy connects to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// One connection per resolved address. Needed when several physical brokers
    /// sit behind one DNS name and each must be drained.
    #[default]
    All,
    /// A single address chosen uniformly at random.
    Any,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Any => f.write_str("any"),
        }
    }
}

/// TLS material handed to the [`Connector`](crate::transport::Connector).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// Whether the connection is wrapped in TLS.
    pub use_ssl: bool,
    /// Client certificate (PEM).
    pub cert_file: Option<PathBuf>,
    /// Private key matching `cert_file` (PEM).
    pub key_file: Option<PathBuf>,
}

impl TlsOptions {
    /// Plain TCP.
    #[must_use]
    pub const fn plain() -> Self {
        Self {
            use_ssl: false,
            cert_file: None,
            key_file: None,
        }
    }
}

/// Login material sent on `CONNECT`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Broker login.
    pub username: Option<String>,
    /// Broker passcode.
    pub passcode: Option<String>,
    /// Virtual host, sent as the `host` header.
    pub vhost: Option<String>,
}

// Passcodes never reach the logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("passcode", &self.passcode.as_ref().map(|_| "********"))
            .field("vhost", &self.vhost)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_mode_uses_stomp_names() {
        assert_eq!(AckMode::ClientIndividual.as_str(), "client-individual");
        let parsed: AckMode = serde_json::from_str("\"client\"").unwrap();
        assert_eq!(parsed, AckMode::Client);
        assert!(!AckMode::Auto.requires_ack());
    }

    #[test]
    fn credentials_debug_hides_passcode() {
        let creds = Credentials {
            username: Some("admin".into()),
            passcode: Some("secret".into()),
            vhost: None,
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("secret"));
    }
}
