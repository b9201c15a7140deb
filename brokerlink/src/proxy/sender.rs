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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, warn};

use super::state::{ProxyIdentity, ProxyState};
use super::{ProxyContext, ProxyError, ProxyStatus};
use crate::common::{AckMode, ConnectionMode, Credentials, TlsOptions};
use crate::transport::{
    build_connections, AddressResolver, BrokerConnection, ConnectParams,
    ConnectionListener, Connector, Headers, MessageFrame,
};

/// Construction options for a [`SenderProxy`].
#[derive(Debug, Clone, Default)]
pub struct SenderOptions {
    /// TLS material.
    pub tls: TlsOptions,
    /// Login material.
    pub credentials: Credentials,
    /// Log every send.
    pub verbose: bool,
}

impl SenderOptions {
    /// Sets TLS material.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Sets login material.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Enables per-send logging.
    #[must_use]
    pub const fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Publishes messages to one destination over a single connection.
///
/// The connection is picked at random among the resolved broker addresses.
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct SenderProxy {
    inner: Arc<SenderInner>,
}

struct SenderInner {
    name: String,
    destination: String,
    host_port_list: Vec<String>,
    options: SenderOptions,
    identity: ProxyIdentity,
    state: Arc<ProxyState>,
    connection: RwLock<(String, Arc<dyn BrokerConnection>)>,
    resolver: Arc<dyn AddressResolver>,
    connector: Arc<dyn Connector>,
    sent: AtomicUsize,
}

impl SenderProxy {
    /// Resolves the endpoints and picks one connection.
    ///
    /// # Errors
    ///
    /// Malformed or unresolvable endpoints, and unusable TLS material.
    pub async fn new(
        name: &str,
        destination: &str,
        host_port_list: &[String],
        options: SenderOptions,
        context: &ProxyContext,
    ) -> Result<Self, ProxyError> {
        let connection = pick_connection(
            name,
            host_port_list,
            &options.tls,
            context.resolver.as_ref(),
            context.connector.as_ref(),
        )
        .await?;
        let identity = ProxyIdentity::generate("SenderProxy");
        debug!(proxy = name, conn_id = %connection.0, "sender proxy created");
        Ok(Self {
            inner: Arc::new(SenderInner {
                name: name.to_string(),
                destination: destination.to_string(),
                host_port_list: host_port_list.to_vec(),
                options,
                identity,
                state: Arc::new(ProxyState::default()),
                connection: RwLock::new(connection),
                resolver: Arc::clone(&context.resolver),
                connector: Arc::clone(&context.connector),
                sent: AtomicUsize::new(0),
            }),
        })
    }

    fn current(&self) -> (String, Arc<dyn BrokerConnection>) {
        let guard = self.inner.connection.read();
        (guard.0.clone(), Arc::clone(&guard.1))
    }

    /// Publishes `body` to the destination.
    ///
    /// # Errors
    ///
    /// Transport errors are returned unchanged.
    pub async fn send(&self, body: &str) -> Result<(), ProxyError> {
        let (conn_id, connection) = self.current();
        connection
            .send(&self.inner.destination, body, &Headers::new())
            .await
            .map_err(ProxyError::transport(&conn_id))?;
        self.inner.sent.fetch_add(1, Ordering::Relaxed);
        if self.inner.options.verbose {
            debug!(proxy = %self.inner.name, "send to {} {:?}", self.inner.destination, body);
        }
        Ok(())
    }

    /// Drains the destination for `duration`, dropping whatever arrives.
    ///
    /// # Errors
    ///
    /// Subscribe or unsubscribe failures.
    pub async fn waste(&self, duration: Duration) -> Result<(), ProxyError> {
        let (conn_id, connection) = self.current();
        connection
            .subscribe(
                &self.inner.destination,
                &self.inner.identity.sub_id,
                AckMode::Auto,
                &Headers::new(),
            )
            .await
            .map_err(ProxyError::transport(&conn_id))?;
        tokio::time::sleep(duration).await;
        connection
            .unsubscribe(&self.inner.identity.sub_id)
            .await
            .map_err(ProxyError::transport(&conn_id))?;
        debug!(proxy = %self.inner.name, "waste dropped messages for {:?}", duration);
        Ok(())
    }

    /// Connects unless already connected.
    ///
    /// # Errors
    ///
    /// The connect failure; the proxy is left marked disconnected.
    #[instrument(skip(self), fields(proxy = %self.inner.name))]
    pub async fn go(&self) -> Result<(), ProxyError> {
        let inner = &self.inner;
        debug!("go called");
        inner.state.reset();
        let (conn_id, connection) = self.current();
        if connection.is_connected() {
            info!(
                "connection to {} {} already exists. Skipped...",
                conn_id, inner.destination
            );
            return Ok(());
        }
        connection.set_listener(Arc::new(SenderListener {
            name: inner.name.clone(),
            state: Arc::clone(&inner.state),
        }));
        let mut headers = Headers::new();
        headers.insert("client-id".into(), inner.identity.client_id.clone());
        let params = ConnectParams {
            credentials: inner.options.credentials.clone(),
            headers,
        };
        if let Err(e) = connection.connect(&params).await {
            error!(
                "failed to start connection to {} {} ; {}",
                conn_id, inner.destination, e
            );
            inner.state.mark_dropped();
            return Err(ProxyError::Transport {
                conn_id,
                source: e,
            });
        }
        info!("connected to {} {}", conn_id, inner.destination);
        Ok(())
    }

    /// Disconnects.
    #[instrument(skip(self), fields(proxy = %self.inner.name))]
    pub async fn stop(&self) {
        debug!("stop called");
        self.inner.state.begin_stop();
        let (conn_id, connection) = self.current();
        match connection.disconnect().await {
            Ok(()) => info!("disconnect from {} {}", conn_id, self.inner.destination),
            Err(e) => warn!("error disconnecting from {} ; {}", conn_id, e),
        }
    }

    /// Stops, picks a fresh connection and starts again.
    ///
    /// # Errors
    ///
    /// Resolution or connection failures.
    #[instrument(skip(self), fields(proxy = %self.inner.name))]
    pub async fn restart(&self) -> Result<(), ProxyError> {
        let inner = &self.inner;
        let restarts = inner.state.record_restart();
        info!(restarts, "restart called");
        self.stop().await;
        match pick_connection(
            &inner.name,
            &inner.host_port_list,
            &inner.options.tls,
            inner.resolver.as_ref(),
            inner.connector.as_ref(),
        )
        .await
        {
            Ok(connection) => *inner.connection.write() = connection,
            Err(e) => {
                error!("failed to rebuild connection ; {}", e);
                inner.state.mark_dropped();
                return Err(e);
            }
        }
        self.go().await
    }

    /// Logical name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Broker destination.
    pub fn destination(&self) -> &str {
        &self.inner.destination
    }

    /// Client id sent on `CONNECT`.
    pub fn client_id(&self) -> &str {
        &self.inner.identity.client_id
    }

    /// Id of the connection in use.
    pub fn connection_id(&self) -> String {
        self.inner.connection.read().0.clone()
    }

    /// Messages published since construction.
    pub fn sent_count(&self) -> usize {
        self.inner.sent.load(Ordering::Relaxed)
    }

    /// Whether a disconnect has been observed since the last `go`.
    pub fn got_disconnected(&self) -> bool {
        self.inner.state.got_disconnected()
    }

    /// Whether the proxy is being stopped on purpose.
    pub fn to_disconnect(&self) -> bool {
        self.inner.state.to_disconnect()
    }

    /// Restarts since construction.
    pub fn restart_count(&self) -> u32 {
        self.inner.state.restart_count()
    }

    /// Current flags and connection.
    pub fn status(&self) -> ProxyStatus {
        ProxyStatus {
            name: self.inner.name.clone(),
            destination: self.inner.destination.clone(),
            got_disconnected: self.got_disconnected(),
            to_disconnect: self.to_disconnect(),
            restarts: self.restart_count(),
            connections: vec![self.connection_id()],
        }
    }
}

impl fmt::Debug for SenderProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderProxy")
            .field("name", &self.inner.name)
            .field("destination", &self.inner.destination)
            .field("connection", &self.connection_id())
            .finish_non_exhaustive()
    }
}

async fn pick_connection(
    name: &str,
    host_port_list: &[String],
    tls: &TlsOptions,
    resolver: &dyn AddressResolver,
    connector: &dyn Connector,
) -> Result<(String, Arc<dyn BrokerConnection>), ProxyError> {
    build_connections(host_port_list, tls, ConnectionMode::Any, resolver, connector)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ProxyError::NoConnection(name.to_string()))
}

struct SenderListener {
    name: String,
    state: Arc<ProxyState>,
}

impl ConnectionListener for SenderListener {
    fn on_message(&self, frame: MessageFrame) {
        debug!(proxy = %self.name, "drop message: {:?} {:?}", frame.headers, frame.body);
    }

    fn on_error(&self, frame: MessageFrame) {
        error!(proxy = %self.name, "on_error: {:?} {:?}", frame.headers, frame.body);
    }

    fn on_disconnected(&self) {
        self.state.mark_disconnected();
        info!(proxy = %self.name, "on_disconnected");
    }
}
