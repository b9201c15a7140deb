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

//! An in-process broker speaking the transport traits.
//!
//! [`MemoryBroker`] keeps named queues and delivers each message to one
//! subscriber of its destination, round-robin. It honors acknowledgement
//! modes, prefetch limits (`activemq.prefetchSize` or `prefetch-count`),
//! transactions, `NACK` redelivery and requeues unacknowledged messages when a
//! session ends. Every connector built from one broker shares its queues, the
//! way several nodes of a broker cluster would.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    BrokerConnection, ConnectParams, ConnectionListener, Connector, Endpoint, Headers,
    MessageFrame, TransportError,
};
use crate::common::{AckMode, TlsOptions};

/// Shared handle to an in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    credentials: Option<(String, String)>,
    refuse: AtomicBool,
    connections_created: AtomicUsize,
    listener_registrations: AtomicUsize,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    sessions: HashMap<u64, Session>,
    subscriptions: Vec<Subscription>,
    in_flight: HashMap<String, InFlight>,
    next_message: u64,
    next_ack: u64,
    next_session: u64,
    cursor: usize,
}

struct Session {
    endpoint: Endpoint,
    connected: bool,
    listener: Option<Arc<dyn ConnectionListener>>,
    transactions: HashMap<String, Vec<PendingOp>>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    destination: String,
    body: String,
    headers: Headers,
    redelivered: bool,
}

struct Subscription {
    session: u64,
    id: String,
    destination: String,
    ack: AckMode,
    prefetch: Option<usize>,
}

struct InFlight {
    session: u64,
    subscription: String,
    message: StoredMessage,
}

enum PendingOp {
    Ack(String),
    Nack(String),
}

type Delivery = (Arc<dyn ConnectionListener>, MessageFrame);

impl MemoryBroker {
    /// Creates a broker accepting any login.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a broker that only accepts `username`/`passcode`.
    #[must_use]
    pub fn with_credentials(username: &str, passcode: &str) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                credentials: Some((username.to_string(), passcode.to_string())),
                ..BrokerInner::default()
            }),
        }
    }

    /// A connector whose connections all reach this broker.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Enqueues a message without going through a session.
    pub fn publish(&self, destination: &str, body: &str) {
        self.inner
            .state
            .lock()
            .enqueue(destination, body, Headers::new());
        self.inner.dispatch();
    }

    /// Messages waiting on `destination`, excluding in-flight ones.
    #[must_use]
    pub fn depth(&self, destination: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(destination)
            .map_or(0, VecDeque::len)
    }

    /// Delivered but not yet acknowledged messages, across all destinations.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Removes and returns the bodies waiting on `destination`.
    pub fn drain(&self, destination: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .queues
            .get_mut(destination)
            .map(|queue| queue.drain(..).map(|m| m.body).collect())
            .unwrap_or_default()
    }

    /// Makes subsequent `CONNECT`s fail (or succeed again).
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Drops every open session from the broker side, as a network failure would.
    pub fn sever_all(&self) {
        let sessions: Vec<u64> = {
            let state = self.inner.state.lock();
            state
                .sessions
                .iter()
                .filter(|(_, s)| s.connected)
                .map(|(id, _)| *id)
                .collect()
        };
        for session in sessions {
            self.inner.close(session);
        }
    }

    /// Connections handed out by connectors of this broker.
    #[must_use]
    pub fn connections_created(&self) -> usize {
        self.inner.connections_created.load(Ordering::SeqCst)
    }

    /// Calls to `set_listener` across all connections.
    #[must_use]
    pub fn listener_registrations(&self) -> usize {
        self.inner.listener_registrations.load(Ordering::SeqCst)
    }

    /// Sessions currently connected.
    #[must_use]
    pub fn connected_sessions(&self) -> usize {
        self.inner
            .state
            .lock()
            .sessions
            .values()
            .filter(|s| s.connected)
            .count()
    }

    /// Active subscriptions on `destination`.
    #[must_use]
    pub fn subscriptions(&self, destination: &str) -> usize {
        self.inner
            .state
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.destination == destination)
            .count()
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryBroker")
            .field("queues", &state.queues.len())
            .field("sessions", &state.sessions.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

impl BrokerInner {
    /// Delivers whatever can be delivered. Callbacks run after the lock is released.
    fn dispatch(&self) {
        let deliveries = self.state.lock().collect_deliveries();
        for (listener, frame) in deliveries {
            listener.on_message(frame);
        }
    }

    fn close(&self, session: u64) {
        let listener = {
            let mut state = self.state.lock();
            let Some(entry) = state.sessions.get_mut(&session) else {
                return;
            };
            if !entry.connected {
                return;
            }
            entry.connected = false;
            entry.transactions.clear();
            let listener = entry.listener.clone();
            state.subscriptions.retain(|s| s.session != session);
            state.requeue_where(|f| f.session == session);
            listener
        };
        trace!(session, "session closed");
        if let Some(listener) = listener {
            listener.on_disconnected();
        }
        self.dispatch();
    }
}

impl BrokerState {
    fn enqueue(&mut self, destination: &str, body: &str, headers: Headers) {
        self.next_message += 1;
        let message = StoredMessage {
            id: format!("ID:memory-{}", self.next_message),
            destination: destination.to_string(),
            body: body.to_string(),
            headers,
            redelivered: false,
        };
        self.queues
            .entry(destination.to_string())
            .or_default()
            .push_back(message);
    }

    fn session(&mut self, session: u64) -> Result<&mut Session, TransportError> {
        match self.sessions.get_mut(&session) {
            Some(s) if s.connected => Ok(s),
            Some(s) => Err(TransportError::NotConnected(s.endpoint.to_string())),
            None => Err(TransportError::NotConnected(format!("session {session}"))),
        }
    }

    fn check_in_flight(&self, session: u64, ack_id: &str) -> Result<(), TransportError> {
        match self.in_flight.get(ack_id) {
            Some(f) if f.session == session => Ok(()),
            _ => Err(TransportError::Protocol(format!("unknown ack id {ack_id}"))),
        }
    }

    fn settle(&mut self, op: PendingOp) {
        match op {
            PendingOp::Ack(ack_id) => {
                self.in_flight.remove(&ack_id);
            }
            PendingOp::Nack(ack_id) => {
                if let Some(flight) = self.in_flight.remove(&ack_id) {
                    self.requeue(flight.message);
                }
            }
        }
    }

    fn requeue(&mut self, mut message: StoredMessage) {
        message.redelivered = true;
        self.queues
            .entry(message.destination.clone())
            .or_default()
            .push_front(message);
    }

    fn requeue_where(&mut self, predicate: impl Fn(&InFlight) -> bool) {
        let ids: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| predicate(f))
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(flight) = self.in_flight.remove(&id) {
                self.requeue(flight.message);
            }
        }
    }

    fn unacked(&self, session: u64, subscription: &str) -> usize {
        self.in_flight
            .values()
            .filter(|f| f.session == session && f.subscription == subscription)
            .count()
    }

    fn eligible(&self, index: usize, destination: &str) -> bool {
        let sub = &self.subscriptions[index];
        if sub.destination != destination {
            return false;
        }
        let Some(session) = self.sessions.get(&sub.session) else {
            return false;
        };
        if !session.connected || session.listener.is_none() {
            return false;
        }
        match sub.prefetch {
            Some(limit) if sub.ack.requires_ack() => self.unacked(sub.session, &sub.id) < limit,
            _ => true,
        }
    }

    fn next_subscriber(&mut self, destination: &str) -> Option<usize> {
        let count = self.subscriptions.len();
        let found = (0..count)
            .map(|step| (self.cursor + step) % count)
            .find(|&index| self.eligible(index, destination))?;
        self.cursor = found + 1;
        Some(found)
    }

    fn collect_deliveries(&mut self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        loop {
            let mut progressed = false;
            let destinations: Vec<String> = self
                .queues
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(d, _)| d.clone())
                .collect();
            for destination in destinations {
                let Some(index) = self.next_subscriber(&destination) else {
                    continue;
                };
                let Some(message) = self
                    .queues
                    .get_mut(&destination)
                    .and_then(VecDeque::pop_front)
                else {
                    continue;
                };
                let (session, sub_id, ack) = {
                    let sub = &self.subscriptions[index];
                    (sub.session, sub.id.clone(), sub.ack)
                };
                let Some(listener) = self.sessions.get(&session).and_then(|s| s.listener.clone())
                else {
                    continue;
                };

                let mut headers = message.headers.clone();
                headers.insert("destination".into(), message.destination.clone());
                headers.insert("message-id".into(), message.id.clone());
                headers.insert("subscription".into(), sub_id.clone());
                if message.redelivered {
                    headers.insert("redelivered".into(), "true".into());
                }
                if ack.requires_ack() {
                    self.next_ack += 1;
                    let ack_id = format!("ack-{}", self.next_ack);
                    headers.insert("ack".into(), ack_id.clone());
                    self.in_flight.insert(
                        ack_id,
                        InFlight {
                            session,
                            subscription: sub_id,
                            message: message.clone(),
                        },
                    );
                }
                deliveries.push((listener, MessageFrame::new(headers, message.body)));
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        deliveries
    }
}

/// Builds [`MemoryConnection`]s attached to one [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    /// The broker behind this connector.
    #[must_use]
    pub const fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

impl Connector for MemoryConnector {
    fn connection(
        &self,
        endpoint: &Endpoint,
        tls: &TlsOptions,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        if tls.use_ssl && tls.cert_file.is_some() != tls.key_file.is_some() {
            return Err(TransportError::Tls(
                "certificate and key must be given together".to_string(),
            ));
        }
        let inner = Arc::clone(&self.broker.inner);
        let session = {
            let mut state = inner.state.lock();
            state.next_session += 1;
            let id = state.next_session;
            state.sessions.insert(
                id,
                Session {
                    endpoint: endpoint.clone(),
                    connected: false,
                    listener: None,
                    transactions: HashMap::new(),
                },
            );
            id
        };
        inner.connections_created.fetch_add(1, Ordering::SeqCst);
        debug!(%endpoint, session, "memory connection created");
        Ok(Arc::new(MemoryConnection {
            session,
            endpoint: endpoint.clone(),
            broker: inner,
        }))
    }
}

/// One session on a [`MemoryBroker`].
pub struct MemoryConnection {
    session: u64,
    endpoint: Endpoint,
    broker: Arc<BrokerInner>,
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("session", &self.session)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn set_listener(&self, listener: Arc<dyn ConnectionListener>) {
        if let Some(session) = self.broker.state.lock().sessions.get_mut(&self.session) {
            session.listener = Some(listener);
        }
        self.broker
            .listener_registrations
            .fetch_add(1, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.broker
            .state
            .lock()
            .sessions
            .get(&self.session)
            .is_some_and(|s| s.connected)
    }

    async fn connect(&self, params: &ConnectParams) -> Result<(), TransportError> {
        if self.broker.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Refused {
                endpoint: self.endpoint.to_string(),
                reason: "broker is not accepting connections".to_string(),
            });
        }
        if let Some((username, passcode)) = &self.broker.credentials {
            let creds = &params.credentials;
            if creds.username.as_ref() != Some(username) || creds.passcode.as_ref() != Some(passcode)
            {
                return Err(TransportError::Refused {
                    endpoint: self.endpoint.to_string(),
                    reason: "bad credentials".to_string(),
                });
            }
        }
        let mut state = self.broker.state.lock();
        let session = state
            .sessions
            .get_mut(&self.session)
            .ok_or_else(|| TransportError::NotConnected(self.endpoint.to_string()))?;
        session.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.broker.close(self.session);
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
        id: &str,
        ack: AckMode,
        headers: &Headers,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.broker.state.lock();
            state.session(self.session)?;
            let prefetch = headers
                .get("activemq.prefetchSize")
                .or_else(|| headers.get("prefetch-count"))
                .and_then(|v| v.parse::<usize>().ok());
            state.subscriptions.push(Subscription {
                session: self.session,
                id: id.to_string(),
                destination: destination.to_string(),
                ack,
                prefetch,
            });
        }
        self.broker.dispatch();
        Ok(())
    }

    async fn unsubscribe(&self, id: &str) -> Result<(), TransportError> {
        {
            let mut state = self.broker.state.lock();
            state.session(self.session)?;
            let session = self.session;
            state
                .subscriptions
                .retain(|s| !(s.session == session && s.id == id));
            state.requeue_where(|f| f.session == session && f.subscription == id);
        }
        self.broker.dispatch();
        Ok(())
    }

    async fn send(
        &self,
        destination: &str,
        body: &str,
        headers: &Headers,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.broker.state.lock();
            state.session(self.session)?;
            state.enqueue(destination, body, headers.clone());
        }
        self.broker.dispatch();
        Ok(())
    }

    async fn ack(&self, ack_id: &str, transaction: Option<&str>) -> Result<(), TransportError> {
        self.settle(PendingOp::Ack(ack_id.to_string()), ack_id, transaction)
    }

    async fn nack(&self, ack_id: &str, transaction: Option<&str>) -> Result<(), TransportError> {
        self.settle(PendingOp::Nack(ack_id.to_string()), ack_id, transaction)
    }

    async fn begin(&self, transaction: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        let session = state.session(self.session)?;
        if session.transactions.contains_key(transaction) {
            return Err(TransportError::Protocol(format!(
                "transaction {transaction} already open"
            )));
        }
        session
            .transactions
            .insert(transaction.to_string(), Vec::new());
        Ok(())
    }

    async fn commit(&self, transaction: &str) -> Result<(), TransportError> {
        {
            let mut state = self.broker.state.lock();
            let ops = state
                .session(self.session)?
                .transactions
                .remove(transaction)
                .ok_or_else(|| unknown_transaction(transaction))?;
            for op in ops {
                state.settle(op);
            }
        }
        self.broker.dispatch();
        Ok(())
    }

    async fn abort(&self, transaction: &str) -> Result<(), TransportError> {
        {
            let mut state = self.broker.state.lock();
            let ops = state
                .session(self.session)?
                .transactions
                .remove(transaction)
                .ok_or_else(|| unknown_transaction(transaction))?;
            // Acks inside an aborted transaction never happened: the messages go back.
            for op in ops {
                let (PendingOp::Ack(ack_id) | PendingOp::Nack(ack_id)) = op;
                state.settle(PendingOp::Nack(ack_id));
            }
        }
        self.broker.dispatch();
        Ok(())
    }
}

impl MemoryConnection {
    fn settle(
        &self,
        op: PendingOp,
        ack_id: &str,
        transaction: Option<&str>,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.broker.state.lock();
            state.session(self.session)?;
            state.check_in_flight(self.session, ack_id)?;
            match transaction {
                Some(tx) => state
                    .session(self.session)?
                    .transactions
                    .get_mut(tx)
                    .ok_or_else(|| unknown_transaction(tx))?
                    .push(op),
                None => state.settle(op),
            }
        }
        self.broker.dispatch();
        Ok(())
    }
}

fn unknown_transaction(transaction: &str) -> TransportError {
    TransportError::Protocol(format!("unknown transaction {transaction}"))
}
