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

use crate::transport::{ResolveError, TransportError};

/// Errors raised by listener and sender proxies.
#[derive(Debug)]
pub enum ProxyError {
    /// Endpoints could not be resolved into connections.
    Resolve(ResolveError),
    /// A broker operation failed on one connection.
    Transport {
        /// Connection id (`fqdn:port`).
        conn_id: String,
        /// Underlying failure.
        source: TransportError,
    },
    /// The connection that delivered a message is no longer owned by the proxy,
    /// typically because a restart rebuilt the connection set.
    UnknownConnection(String),
    /// The proxy that delivered this message id has been dropped.
    ProxyGone(String),
    /// Resolution produced no connection for the named proxy.
    NoConnection(String),
}

impl ProxyError {
    pub(crate) fn transport(conn_id: &str) -> impl FnOnce(TransportError) -> Self {
        let conn_id = conn_id.to_string();
        move |source| Self::Transport { conn_id, source }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve(e) => write!(f, "{e}"),
            Self::Transport { conn_id, source } => write!(f, "{conn_id}: {source}"),
            Self::UnknownConnection(conn_id) => {
                write!(f, "connection {conn_id} is not owned by this proxy")
            }
            Self::ProxyGone(msg_id) => write!(f, "proxy for message {msg_id} no longer exists"),
            Self::NoConnection(name) => write!(f, "no broker connection for {name}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Resolve(e) => Some(e),
            Self::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ResolveError> for ProxyError {
    fn from(e: ResolveError) -> Self {
        Self::Resolve(e)
    }
}
