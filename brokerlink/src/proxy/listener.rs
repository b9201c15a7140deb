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

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, warn};

use super::state::{ProxyIdentity, ProxyState};
use super::{ProxyContext, ProxyError, ProxyStatus};
use crate::common::{AckMode, ConnectionMode, Credentials, MessageBuffer, TlsOptions, SETTINGS};
use crate::message::{
    CompletionOutcome, MessageEnvelope, RedeliveryDecision, RedeliveryPolicy, RedeliveryTracker,
};
use crate::transport::{
    build_connections, AddressResolver, BrokerConnection, ConnectParams,
    ConnectionListener, ConnectionMap, Connector, Headers, MessageFrame,
};

/// Construction options for a [`ListenerProxy`].
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Acknowledgement mode used on `SUBSCRIBE`.
    pub ack_mode: AckMode,
    /// Connect to every resolved address or to one of them.
    pub conn_mode: ConnectionMode,
    /// Maximum unacknowledged messages the broker may push.
    pub prefetch_size: Option<u32>,
    /// Capture payloads in memory and acknowledge immediately instead of buffering.
    pub skip_buffer: bool,
    /// Log every delivery.
    pub verbose: bool,
    /// Wrap settling in a transaction. Ignored in `auto` mode.
    pub use_transaction: bool,
    /// What to do with messages that keep failing.
    pub redelivery: RedeliveryPolicy,
    /// TLS material.
    pub tls: TlsOptions,
    /// Login material.
    pub credentials: Credentials,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::ClientIndividual,
            conn_mode: ConnectionMode::All,
            prefetch_size: None,
            skip_buffer: false,
            verbose: false,
            use_transaction: SETTINGS.proxy.use_transaction,
            redelivery: SETTINGS.redelivery.clone(),
            tls: TlsOptions::plain(),
            credentials: Credentials::default(),
        }
    }
}

impl ListenerOptions {
    /// Sets the acknowledgement mode.
    #[must_use]
    pub const fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    /// Sets the connection mode.
    #[must_use]
    pub const fn with_conn_mode(mut self, conn_mode: ConnectionMode) -> Self {
        self.conn_mode = conn_mode;
        self
    }

    /// Sets the prefetch limit.
    #[must_use]
    pub const fn with_prefetch(mut self, prefetch_size: Option<u32>) -> Self {
        self.prefetch_size = prefetch_size;
        self
    }

    /// Enables capture mode.
    #[must_use]
    pub const fn with_skip_buffer(mut self, skip_buffer: bool) -> Self {
        self.skip_buffer = skip_buffer;
        self
    }

    /// Enables per-delivery logging.
    #[must_use]
    pub const fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Enables or disables transactional settling.
    #[must_use]
    pub const fn with_transaction(mut self, use_transaction: bool) -> Self {
        self.use_transaction = use_transaction;
        self
    }

    /// Sets the redelivery policy.
    #[must_use]
    pub fn with_redelivery(mut self, redelivery: RedeliveryPolicy) -> Self {
        self.redelivery = redelivery;
        self
    }

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

    fn transactional(&self) -> bool {
        self.use_transaction && self.ack_mode.requires_ack()
    }
}

/// Delivery counters of one listener proxy.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Messages delivered by the broker.
    pub messages_received: AtomicUsize,
    /// Messages acknowledged.
    pub messages_acknowledged: AtomicUsize,
    /// Messages rejected or aborted.
    pub messages_rejected: AtomicUsize,
    /// Messages dead-lettered by the redelivery policy.
    pub messages_dead_lettered: AtomicUsize,
}

impl ListenerStats {
    /// Get the number of messages received.
    #[must_use]
    pub fn messages_received(&self) -> usize {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Get the number of messages acknowledged.
    #[must_use]
    pub fn messages_acknowledged(&self) -> usize {
        self.messages_acknowledged.load(Ordering::Relaxed)
    }

    /// Get the number of messages rejected or aborted.
    #[must_use]
    pub fn messages_rejected(&self) -> usize {
        self.messages_rejected.load(Ordering::Relaxed)
    }

    /// Get the number of messages dead-lettered.
    #[must_use]
    pub fn messages_dead_lettered(&self) -> usize {
        self.messages_dead_lettered.load(Ordering::Relaxed)
    }
}

/// Receives messages from one destination and deposits them in its buffer.
///
/// In `all` mode the proxy holds one connection per resolved broker address
/// and settles every message on the connection that delivered it. Messages
/// land in the [`MessageBuffer`] named after the proxy; with `skip_buffer`
/// they are captured in memory and acknowledged right away instead, which is
/// only meant for deterministic tests.
///
/// Cloning the proxy yields another handle to the same connections and state.
#[derive(Clone)]
pub struct ListenerProxy {
    inner: Arc<ListenerInner>,
}

pub(crate) struct ListenerInner {
    name: String,
    destination: String,
    host_port_list: Vec<String>,
    options: ListenerOptions,
    identity: ProxyIdentity,
    state: ProxyState,
    connections: RwLock<ConnectionMap>,
    buffer: Arc<MessageBuffer>,
    captured: Mutex<Vec<String>>,
    resolver: Arc<dyn AddressResolver>,
    connector: Arc<dyn Connector>,
    runtime: Mutex<Option<Handle>>,
    redelivery: RedeliveryTracker,
    stats: ListenerStats,
}

impl ListenerProxy {
    /// Resolves the endpoints and builds the connection set.
    ///
    /// Nothing is connected until [`go`](Self::go).
    ///
    /// # Errors
    ///
    /// Malformed or unresolvable endpoints, and unusable TLS material.
    pub async fn new(
        name: &str,
        destination: &str,
        host_port_list: &[String],
        options: ListenerOptions,
        context: &ProxyContext,
    ) -> Result<Self, ProxyError> {
        let connections = build_connections(
            host_port_list,
            &options.tls,
            options.conn_mode,
            context.resolver.as_ref(),
            context.connector.as_ref(),
        )
        .await?;
        let identity = ProxyIdentity::generate("ListenerProxy");
        debug!(
            proxy = name,
            sub_id = %identity.sub_id,
            connections = connections.len(),
            "listener proxy created"
        );
        Ok(Self {
            inner: Arc::new(ListenerInner {
                name: name.to_string(),
                destination: destination.to_string(),
                host_port_list: host_port_list.to_vec(),
                redelivery: RedeliveryTracker::new(options.redelivery.clone()),
                options,
                identity,
                state: ProxyState::default(),
                connections: RwLock::new(connections),
                buffer: context.buffers.get_or_create(name),
                captured: Mutex::new(Vec::new()),
                resolver: Arc::clone(&context.resolver),
                connector: Arc::clone(&context.connector),
                runtime: Mutex::new(None),
                stats: ListenerStats::default(),
            }),
        })
    }

    /// Connects and subscribes every owned connection that is not connected yet.
    ///
    /// The first failure is logged, marks the proxy disconnected and ends the
    /// call; the guard's restart picks up from there.
    ///
    /// # Errors
    ///
    /// The failure that stopped the sequence.
    #[instrument(skip(self), fields(proxy = %self.inner.name))]
    pub async fn go(&self) -> Result<(), ProxyError> {
        let inner = &self.inner;
        debug!("go called");
        inner.capture_runtime();
        inner.state.reset();
        for (conn_id, connection) in inner.snapshot() {
            if connection.is_connected() {
                info!(
                    "connection to {} {} already exists. Skipped...",
                    conn_id, inner.destination
                );
                continue;
            }
            if let Err(e) = inner.open(&conn_id, connection.as_ref()).await {
                error!(
                    "failed to start connection to {} {} ; {}",
                    conn_id, inner.destination, e
                );
                inner.state.mark_dropped();
                return Err(e);
            }
            info!("connected to {} {}", conn_id, inner.destination);
        }
        Ok(())
    }

    /// Disconnects every owned connection.
    ///
    /// `to_disconnect` is raised first, so the resulting disconnect callbacks
    /// are not mistaken for a dropped connection.
    #[instrument(skip(self), fields(proxy = %self.inner.name))]
    pub async fn stop(&self) {
        let inner = &self.inner;
        debug!("stop called");
        inner.state.begin_stop();
        for (conn_id, connection) in inner.snapshot() {
            match connection.disconnect().await {
                Ok(()) => info!("disconnect from {} {}", conn_id, inner.destination),
                Err(e) => warn!("error disconnecting from {} ; {}", conn_id, e),
            }
        }
    }

    /// Stops, re-resolves the endpoints and starts again.
    ///
    /// The restart counter grows before anything else happens and is never reset.
    ///
    /// # Errors
    ///
    /// Resolution or connection failures; the proxy is left marked disconnected.
    #[instrument(skip(self), fields(proxy = %self.inner.name))]
    pub async fn restart(&self) -> Result<(), ProxyError> {
        let inner = &self.inner;
        let restarts = inner.state.record_restart();
        info!(restarts, "restart called");
        self.stop().await;
        if let Err(e) = inner.rebuild().await {
            error!("failed to rebuild connections ; {}", e);
            inner.state.mark_dropped();
            return Err(e);
        }
        self.go().await
    }

    /// Logical name; also the name of the buffer this proxy fills.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Broker destination.
    pub fn destination(&self) -> &str {
        &self.inner.destination
    }

    /// Subscription id sent on `SUBSCRIBE`.
    pub fn subscription_id(&self) -> &str {
        &self.inner.identity.sub_id
    }

    /// Client id sent on `CONNECT`.
    pub fn client_id(&self) -> &str {
        &self.inner.identity.client_id
    }

    /// Construction options.
    pub fn options(&self) -> &ListenerOptions {
        &self.inner.options
    }

    /// Buffer receiving this proxy's envelopes.
    pub fn buffer(&self) -> Arc<MessageBuffer> {
        Arc::clone(&self.inner.buffer)
    }

    /// Payloads captured in `skip_buffer` mode, in arrival order.
    pub fn captured(&self) -> Vec<String> {
        self.inner.captured.lock().clone()
    }

    /// Takes the captured payloads, leaving the list empty.
    pub fn take_captured(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.captured.lock())
    }

    /// Ids of the owned connections.
    pub fn connection_ids(&self) -> Vec<String> {
        self.inner.connections.read().keys().cloned().collect()
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

    /// Delivery counters.
    pub fn stats(&self) -> &ListenerStats {
        &self.inner.stats
    }

    /// Current flags and connections.
    pub fn status(&self) -> ProxyStatus {
        ProxyStatus {
            name: self.inner.name.clone(),
            destination: self.inner.destination.clone(),
            got_disconnected: self.got_disconnected(),
            to_disconnect: self.to_disconnect(),
            restarts: self.restart_count(),
            connections: self.connection_ids(),
        }
    }
}

impl fmt::Debug for ListenerProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerProxy")
            .field("name", &self.inner.name)
            .field("destination", &self.inner.destination)
            .field("sub_id", &self.inner.identity.sub_id)
            .field("connections", &self.connection_ids())
            .finish_non_exhaustive()
    }
}

impl ListenerInner {
    fn snapshot(&self) -> Vec<(String, Arc<dyn BrokerConnection>)> {
        self.connections
            .read()
            .iter()
            .map(|(id, conn)| (id.clone(), Arc::clone(conn)))
            .collect()
    }

    fn connection(&self, conn_id: &str) -> Result<Arc<dyn BrokerConnection>, ProxyError> {
        self.connections
            .read()
            .get(conn_id)
            .cloned()
            .ok_or_else(|| ProxyError::UnknownConnection(conn_id.to_string()))
    }

    fn capture_runtime(&self) {
        if let Ok(handle) = Handle::try_current() {
            *self.runtime.lock() = Some(handle);
        }
    }

    async fn open(
        self: &Arc<Self>,
        conn_id: &str,
        connection: &dyn BrokerConnection,
    ) -> Result<(), ProxyError> {
        connection.set_listener(Arc::new(DeliveryListener {
            conn_id: conn_id.to_string(),
            proxy: Arc::downgrade(self),
        }));

        let mut connect_headers = Headers::new();
        connect_headers.insert("client-id".into(), self.identity.client_id.clone());
        let params = ConnectParams {
            credentials: self.options.credentials.clone(),
            headers: connect_headers,
        };
        connection
            .connect(&params)
            .await
            .map_err(ProxyError::transport(conn_id))?;

        let mut subscribe_headers = Headers::new();
        if let Some(prefetch) = self.options.prefetch_size {
            // Brokers disagree on the header name.
            subscribe_headers.insert("activemq.prefetchSize".into(), prefetch.to_string());
            subscribe_headers.insert("prefetch-count".into(), prefetch.to_string());
        }
        connection
            .subscribe(
                &self.destination,
                &self.identity.sub_id,
                self.options.ack_mode,
                &subscribe_headers,
            )
            .await
            .map_err(ProxyError::transport(conn_id))
    }

    async fn rebuild(&self) -> Result<(), ProxyError> {
        let connections = build_connections(
            &self.host_port_list,
            &self.options.tls,
            self.options.conn_mode,
            self.resolver.as_ref(),
            self.connector.as_ref(),
        )
        .await?;
        *self.connections.write() = connections;
        Ok(())
    }

    fn on_message(self: &Arc<Self>, conn_id: &str, frame: MessageFrame) {
        let Some(msg_id) = frame.message_id().map(str::to_string) else {
            error!(proxy = %self.name, "dropping frame without message-id: {:?}", frame.headers);
            return;
        };
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        if self.options.verbose {
            debug!(proxy = %self.name, conn_id, %msg_id, "on_message");
        }
        let envelope = MessageEnvelope::from_frame(
            Arc::downgrade(self),
            conn_id,
            &self.identity.sub_id,
            &msg_id,
            frame,
            self.options.transactional(),
        );
        if self.options.skip_buffer {
            self.captured.lock().push(envelope.body().to_string());
            self.settle_captured(envelope);
        } else {
            self.buffer.put(envelope);
            if self.options.verbose {
                debug!(proxy = %self.name, %msg_id, "put into buffer");
            }
        }
    }

    /// Acknowledges a captured message off the delivery path.
    fn settle_captured(&self, envelope: MessageEnvelope) {
        let Some(handle) = self.runtime.lock().clone() else {
            warn!(
                proxy = %self.name,
                msg_id = envelope.message_id(),
                "no runtime captured; captured message left unacknowledged"
            );
            return;
        };
        handle.spawn(async move {
            let msg_id = envelope.message_id().to_string();
            let result = match envelope.acquire().await {
                Ok(acquired) => acquired.complete(true).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(%msg_id, "failed to acknowledge captured message ; {}", e);
            }
        });
    }

    fn on_disconnected(&self, conn_id: &str) {
        self.state.mark_disconnected();
        info!(proxy = %self.name, conn_id, "on_disconnected");
    }

    pub(crate) async fn begin(&self, conn_id: &str, transaction: &str) -> Result<(), ProxyError> {
        self.connection(conn_id)?
            .begin(transaction)
            .await
            .map_err(ProxyError::transport(conn_id))
    }

    async fn commit(&self, conn_id: &str, transaction: &str) -> Result<(), ProxyError> {
        self.connection(conn_id)?
            .commit(transaction)
            .await
            .map_err(ProxyError::transport(conn_id))
    }

    async fn abort(&self, conn_id: &str, transaction: &str) -> Result<(), ProxyError> {
        self.connection(conn_id)?
            .abort(transaction)
            .await
            .map_err(ProxyError::transport(conn_id))
    }

    async fn ack(
        &self,
        envelope: &MessageEnvelope,
        transaction: Option<&str>,
    ) -> Result<(), ProxyError> {
        if !self.options.ack_mode.requires_ack() {
            return Ok(());
        }
        let conn_id = envelope.connection_id();
        self.connection(conn_id)?
            .ack(envelope.ack_id(), transaction)
            .await
            .map_err(ProxyError::transport(conn_id))?;
        debug!(proxy = %self.name, "{} {} ACKed", envelope.message_id(), envelope.ack_id());
        Ok(())
    }

    async fn nack(&self, envelope: &MessageEnvelope) -> Result<(), ProxyError> {
        if !self.options.ack_mode.requires_ack() {
            return Ok(());
        }
        let conn_id = envelope.connection_id();
        self.connection(conn_id)?
            .nack(envelope.ack_id(), None)
            .await
            .map_err(ProxyError::transport(conn_id))?;
        debug!(proxy = %self.name, "{} {} NACKed", envelope.message_id(), envelope.ack_id());
        Ok(())
    }

    async fn forward_dead_letter(
        &self,
        envelope: &MessageEnvelope,
        transaction: Option<&str>,
    ) -> Result<(), ProxyError> {
        let Some(destination) = self.redelivery.policy().dead_letter_destination.as_deref() else {
            return Ok(());
        };
        let conn_id = envelope.connection_id();
        let mut headers = Headers::new();
        headers.insert("original-destination".into(), self.destination.clone());
        headers.insert("original-message-id".into(), envelope.message_id().to_string());
        if let Some(tx) = transaction {
            headers.insert("transaction".into(), tx.to_string());
        }
        self.connection(conn_id)?
            .send(destination, envelope.body(), &headers)
            .await
            .map_err(ProxyError::transport(conn_id))
    }

    /// Acks `envelope` and commits its transaction, if any. A failed ack
    /// aborts the transaction before the error is returned.
    async fn ack_and_commit(
        &self,
        envelope: &MessageEnvelope,
        transaction: Option<&str>,
    ) -> Result<(), ProxyError> {
        if let Err(e) = self.ack(envelope, transaction).await {
            return Err(self.abandon(envelope, transaction, e).await);
        }
        if let Some(tx) = transaction {
            self.commit(envelope.connection_id(), tx).await?;
        }
        Ok(())
    }

    /// Best-effort abort of an open transaction after `cause`; returns `cause`.
    async fn abandon(
        &self,
        envelope: &MessageEnvelope,
        transaction: Option<&str>,
        cause: ProxyError,
    ) -> ProxyError {
        if let Some(tx) = transaction {
            if let Err(e) = self.abort(envelope.connection_id(), tx).await {
                warn!(
                    proxy = %self.name,
                    msg_id = envelope.message_id(),
                    "could not abort {} after failure ; {}",
                    tx,
                    e
                );
            }
        }
        cause
    }

    /// The one terminal action for an acquired envelope.
    pub(crate) async fn finish(
        &self,
        envelope: &MessageEnvelope,
        transaction: Option<&str>,
        success: bool,
    ) -> Result<CompletionOutcome, ProxyError> {
        if success {
            self.redelivery.forget(envelope.message_id());
            self.ack_and_commit(envelope, transaction).await?;
            self.stats
                .messages_acknowledged
                .fetch_add(1, Ordering::Relaxed);
            return Ok(match transaction {
                Some(_) => CompletionOutcome::Committed,
                None => CompletionOutcome::Acknowledged,
            });
        }

        match self.redelivery.record_failure(envelope.message_id()) {
            RedeliveryDecision::Redeliver => {
                let outcome = match transaction {
                    Some(tx) => {
                        self.abort(envelope.connection_id(), tx).await?;
                        CompletionOutcome::Aborted
                    }
                    None => {
                        self.nack(envelope).await?;
                        CompletionOutcome::Rejected
                    }
                };
                self.stats.messages_rejected.fetch_add(1, Ordering::Relaxed);
                Ok(outcome)
            }
            RedeliveryDecision::DeadLetter => {
                warn!(
                    proxy = %self.name,
                    msg_id = envelope.message_id(),
                    "redelivery limit reached; taking message off the queue"
                );
                if let Err(e) = self.forward_dead_letter(envelope, transaction).await {
                    return Err(self.abandon(envelope, transaction, e).await);
                }
                self.ack_and_commit(envelope, transaction).await?;
                // Counted until settled so a failed settle dead-letters again on redelivery.
                self.redelivery.forget(envelope.message_id());
                self.stats
                    .messages_dead_lettered
                    .fetch_add(1, Ordering::Relaxed);
                Ok(CompletionOutcome::DeadLettered)
            }
        }
    }
}

/// Callback object registered on each owned connection.
struct DeliveryListener {
    conn_id: String,
    proxy: std::sync::Weak<ListenerInner>,
}

impl ConnectionListener for DeliveryListener {
    fn on_message(&self, frame: MessageFrame) {
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.on_message(&self.conn_id, frame);
        }
    }

    fn on_error(&self, frame: MessageFrame) {
        error!(conn_id = %self.conn_id, "on_error: {:?} {:?}", frame.headers, frame.body);
    }

    fn on_disconnected(&self) {
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.on_disconnected(&self.conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBroker;
    use crate::transport::StaticResolver;

    async fn context(broker: &MemoryBroker) -> ProxyContext {
        let resolver = StaticResolver::new().with_host("mb", ["node1.example.org"]);
        ProxyContext::new(Arc::new(resolver), Arc::new(broker.connector()))
    }

    #[tokio::test]
    async fn delivered_messages_land_in_named_buffer() {
        let broker = MemoryBroker::new();
        let ctx = context(&broker).await;
        let proxy = ListenerProxy::new(
            "Q1",
            "/queue/q1",
            &["mb:61613".to_string()],
            ListenerOptions::default(),
            &ctx,
        )
        .await
        .unwrap();
        proxy.go().await.unwrap();

        broker.publish("/queue/q1", "hello");

        let buffer = ctx.buffers.get_or_create("Q1");
        assert!(Arc::ptr_eq(&buffer, &proxy.buffer()));
        let envelope = buffer.get().unwrap();
        assert_eq!(envelope.body(), "hello");
        assert_eq!(envelope.connection_id(), "node1.example.org:61613");
        assert_eq!(envelope.subscription_id(), proxy.subscription_id());
        assert_eq!(broker.in_flight(), 1);

        let outcome = envelope.acquire().await.unwrap().complete(true).await.unwrap();
        assert_eq!(outcome, CompletionOutcome::Committed);
        assert_eq!(broker.in_flight(), 0);
        assert_eq!(proxy.stats().messages_acknowledged(), 1);
    }

    #[tokio::test]
    async fn go_failure_marks_disconnected() {
        let broker = MemoryBroker::new();
        broker.set_refuse_connections(true);
        let ctx = context(&broker).await;
        let proxy = ListenerProxy::new(
            "Q1",
            "/queue/q1",
            &["mb:61613".to_string()],
            ListenerOptions::default(),
            &ctx,
        )
        .await
        .unwrap();

        assert!(proxy.go().await.is_err());
        assert!(proxy.got_disconnected());
        assert!(!proxy.to_disconnect());
    }
}
