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

//! Turns configured `host:port` entries into one connection per physical broker.
//!
//! Broker endpoints are often given as a round-robin DNS name fronting several
//! brokers. Each entry is resolved, every address is canonicalized back to a
//! host name, and the resulting `(fqdn, port)` pairs are deduplicated, so
//! `all` mode opens exactly one connection per physical broker.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, trace};

use super::{BrokerConnection, Connector, TransportError};
use crate::common::{ConnectionMode, TlsOptions};

/// Connections keyed by connection id (`fqdn:port`).
pub type ConnectionMap = BTreeMap<String, Arc<dyn BrokerConnection>>;

/// A resolved broker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    /// Canonical host name.
    pub host: String,
    /// Port.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses a `host:port` entry.
    ///
    /// # Errors
    ///
    /// [`ResolveError::Malformed`] when the host is empty or the port is not a `u16`.
    pub fn parse(host_port: &str) -> Result<Self, ResolveError> {
        let malformed = || ResolveError::Malformed(host_port.to_string());
        let (host, port) = host_port.trim().rsplit_once(':').ok_or_else(malformed)?;
        if host.is_empty() {
            return Err(malformed());
        }
        let port = port.parse::<u16>().map_err(|_| malformed())?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Maps a host name to the canonical names of every address behind it.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Resolves `host` and canonicalizes each address to a host name.
    ///
    /// # Errors
    ///
    /// [`ResolveError::Unresolvable`] when the host has no addresses.
    async fn canonical_names(&self, host: &str, port: u16) -> Result<Vec<String>, ResolveError>;
}

/// Resolver backed by the operating system.
///
/// Forward lookup goes through `tokio::net::lookup_host`; each address is then
/// reverse-resolved. An address without a reverse record keeps its textual form.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl AddressResolver for SystemResolver {
    async fn canonical_names(&self, host: &str, port: u16) -> Result<Vec<String>, ResolveError> {
        let unresolvable = |reason: String| ResolveError::Unresolvable {
            host: host.to_string(),
            reason,
        };
        let addrs: Vec<_> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| unresolvable(e.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(unresolvable("no addresses".to_string()));
        }

        let mut names = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let ip = addr.ip();
            let name = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip))
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_else(|| ip.to_string());
            trace!(host, %ip, canonical = %name, "resolved");
            names.push(name);
        }
        Ok(names)
    }
}

/// Resolver answering from a fixed table.
///
/// Useful for tests and for deployments that pin broker nodes by name.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    names: HashMap<String, Vec<String>>,
}

impl StaticResolver {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `host` resolving to `names`.
    #[must_use]
    pub fn with_host<I, S>(mut self, host: &str, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names
            .insert(host.to_string(), names.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl AddressResolver for StaticResolver {
    async fn canonical_names(&self, host: &str, _port: u16) -> Result<Vec<String>, ResolveError> {
        match self.names.get(host) {
            Some(names) if !names.is_empty() => Ok(names.clone()),
            _ => Err(ResolveError::Unresolvable {
                host: host.to_string(),
                reason: "not in static table".to_string(),
            }),
        }
    }
}

/// Resolves and deduplicates a list of `host:port` entries.
///
/// # Errors
///
/// Any malformed or unresolvable entry fails the whole call.
pub async fn resolve_endpoints(
    host_port_list: &[String],
    resolver: &dyn AddressResolver,
) -> Result<BTreeSet<Endpoint>, ResolveError> {
    if host_port_list.is_empty() {
        return Err(ResolveError::NoEndpoints);
    }
    let mut endpoints = BTreeSet::new();
    for host_port in host_port_list {
        let entry = Endpoint::parse(host_port)?;
        for name in resolver.canonical_names(&entry.host, entry.port).await? {
            endpoints.insert(Endpoint::new(name, entry.port));
        }
    }
    Ok(endpoints)
}

/// Builds connections for the resolved addresses selected by `mode`: one per
/// distinct address in `all` mode, a single one in `any` mode.
///
/// # Errors
///
/// Resolution failures, and connector failures such as unusable TLS material.
pub async fn build_connections(
    host_port_list: &[String],
    tls: &TlsOptions,
    mode: ConnectionMode,
    resolver: &dyn AddressResolver,
    connector: &dyn Connector,
) -> Result<ConnectionMap, ResolveError> {
    let endpoints = select_endpoints(resolve_endpoints(host_port_list, resolver).await?, mode);
    let mut connections = ConnectionMap::new();
    for endpoint in endpoints {
        let connection =
            connector
                .connection(&endpoint, tls)
                .map_err(|source| ResolveError::Connection {
                    endpoint: endpoint.to_string(),
                    source,
                })?;
        connections.insert(endpoint.to_string(), connection);
    }
    debug!(
        "got {} connections to {}",
        connections.len(),
        connections.keys().cloned().collect::<Vec<_>>().join(" , ")
    );
    Ok(connections)
}

/// `any` keeps a single address picked uniformly at random.
fn select_endpoints(endpoints: BTreeSet<Endpoint>, mode: ConnectionMode) -> BTreeSet<Endpoint> {
    match mode {
        ConnectionMode::All => endpoints,
        ConnectionMode::Any if endpoints.is_empty() => endpoints,
        ConnectionMode::Any => {
            let pick = rand::rng().random_range(0..endpoints.len());
            endpoints.into_iter().nth(pick).into_iter().collect()
        }
    }
}

/// Errors raised while resolving endpoints.
#[derive(Debug)]
pub enum ResolveError {
    /// An entry is not `host:port`.
    Malformed(String),
    /// The endpoint list is empty.
    NoEndpoints,
    /// A host has no addresses.
    Unresolvable {
        /// The configured host.
        host: String,
        /// Resolver message.
        reason: String,
    },
    /// The connector could not build a connection.
    Connection {
        /// Resolved address.
        endpoint: String,
        /// Underlying failure.
        source: TransportError,
    },
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(entry) => write!(f, "malformed endpoint {entry:?}, expected host:port"),
            Self::NoEndpoints => write!(f, "no broker endpoints configured"),
            Self::Unresolvable { host, reason } => {
                write!(f, "cannot resolve host {host}: {reason}")
            }
            Self::Connection { endpoint, source } => {
                write!(f, "cannot build connection to {endpoint}: {source}")
            }
        }
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBroker;

    #[test]
    fn parse_rejects_malformed_entries() {
        assert_eq!(
            Endpoint::parse("mb.example.org:61613").unwrap(),
            Endpoint::new("mb.example.org", 61613)
        );
        assert!(matches!(
            Endpoint::parse("mb.example.org"),
            Err(ResolveError::Malformed(_))
        ));
        assert!(Endpoint::parse(":61613").is_err());
        assert!(Endpoint::parse("host:notaport").is_err());
    }

    #[tokio::test]
    async fn duplicate_names_collapse_to_one_connection() {
        let resolver = StaticResolver::new()
            .with_host("mb-alias", ["node1.example.org", "node2.example.org"])
            .with_host("node1", ["node1.example.org"]);
        let broker = MemoryBroker::new();
        let connector = broker.connector();

        let connections = build_connections(
            &["mb-alias:61613".to_string(), "node1:61613".to_string()],
            &TlsOptions::plain(),
            ConnectionMode::All,
            &resolver,
            &connector,
        )
        .await
        .unwrap();

        let ids: Vec<_> = connections.keys().cloned().collect();
        assert_eq!(
            ids,
            vec!["node1.example.org:61613", "node2.example.org:61613"]
        );
        assert_eq!(broker.connections_created(), 2);
    }

    #[tokio::test]
    async fn unresolvable_host_is_an_error() {
        let resolver = StaticResolver::new();
        let result = resolve_endpoints(&["ghost:61613".to_string()], &resolver).await;
        assert!(matches!(result, Err(ResolveError::Unresolvable { .. })));
    }

    #[tokio::test]
    async fn any_mode_builds_one_connection() {
        let resolver = StaticResolver::new().with_host("mb", ["a", "b", "c"]);
        let broker = MemoryBroker::new();
        let connections = build_connections(
            &["mb:61613".to_string()],
            &TlsOptions::plain(),
            ConnectionMode::Any,
            &resolver,
            &broker.connector(),
        )
        .await
        .unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(broker.connections_created(), 1);
        let id = connections.keys().next().unwrap();
        assert!(["a:61613", "b:61613", "c:61613"].contains(&id.as_str()));
    }
}
