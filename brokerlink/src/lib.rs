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

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Brokerlink
//!
//! A client layer for STOMP-style message brokers, built on Tokio. It moves
//! messages between broker destinations and user-supplied processing logic
//! while keeping acknowledgement semantics explicit.
//!
//! ## Key Concepts
//!
//! - **Buffers (`MessageBuffer`, `BufferRegistry`)**: one FIFO per queue name holding
//!   received-but-unprocessed envelopes. The registry is an owned object that is
//!   injected wherever a buffer is needed.
//! - **Transport (`BrokerConnection`, `Connector`, `AddressResolver`)**: the seam to the
//!   underlying broker client. An in-process `MemoryBroker` implements it for tests
//!   and local runs.
//! - **Proxies (`ListenerProxy`, `SenderProxy`)**: own broker connections for one
//!   destination, track unexpected disconnects and support restarts.
//! - **Envelopes (`MessageEnvelope`, `AcquiredMessage`)**: single-use delivery handles.
//!   Completing an acquired message performs exactly one terminal broker action.
//! - **Agent (`ProcessingAgent`)**: reads a JSON document, builds proxies and
//!   processor workers, guards proxies and shuts everything down in order.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use brokerlink::prelude::*;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ProcessorPlugin for Echo {
//!     async fn process(&mut self, message: Option<&MessageEnvelope>) -> anyhow::Result<Option<String>> {
//!         Ok(message.map(|m| m.body().to_string()))
//!     }
//! }
//!
//! let plugins = PluginRegistry::new();
//! plugins.register("demo", "Echo", |_| Ok(Box::new(Echo)));
//! let agent = ProcessingAgent::from_path("agent.json", plugins, context)?;
//! let handle = agent.start().await?;
//! // ...
//! handle.shutdown().await?;
//! ```

/// Shared building blocks: settings, logging, buffers and small value types.
pub(crate) mod common;

/// Broker transport abstractions, address resolution and the in-memory broker.
pub(crate) mod transport;

/// Listener and sender proxies.
pub(crate) mod proxy;

/// Message envelopes and redelivery policy.
pub(crate) mod message;

/// Traits implemented by user code and by the proxies.
pub(crate) mod traits;

/// The processing agent, its configuration, plugin registry and workers.
pub(crate) mod agent;

/// In-process broker used by tests and local runs.
pub mod memory {
    pub use crate::transport::memory::{MemoryBroker, MemoryConnector};
}

/// A prelude module for conveniently importing the most commonly used items.
///
/// # Re-exports
///
/// ## External Crates
/// *   [`async_trait::async_trait`](https://docs.rs/async-trait/latest/async_trait/attr.async_trait.html): needed to implement
///     [`ProcessorPlugin`](crate::traits::ProcessorPlugin) and the transport traits.
///
/// ## Core Types
/// *   [`crate::common::BufferRegistry`] and [`crate::common::MessageBuffer`]
/// *   [`crate::proxy::ListenerProxy`], [`crate::proxy::SenderProxy`] and their options
/// *   [`crate::message::MessageEnvelope`] and [`crate::message::AcquiredMessage`]
/// *   [`crate::agent::ProcessingAgent`], [`crate::agent::AgentConfig`] and [`crate::agent::PluginRegistry`]
pub mod prelude {
    pub use async_trait::async_trait;

    pub use crate::agent::{
        AgentConfig, AgentHandle, ConfigError, InitializeHook, PluginConstructor, PluginRegistry,
        ProcessingAgent, ProcessorConfig, ProcessorStats, ProxySet, QueueConfig, ServerConfig,
        WorkerStrategy,
    };
    pub use crate::common::{
        host_pid_token, init_tracing, AckMode, BrokerlinkSettings, BufferRegistry,
        ConnectionMode, Credentials, LoggingSettings, MessageBuffer, TlsOptions, SETTINGS,
    };
    pub use crate::message::{
        AcquiredMessage, CompletionOutcome, MessageEnvelope, RedeliveryDecision,
        RedeliveryPolicy, RedeliveryTracker,
    };
    pub use crate::proxy::{
        ListenerOptions, ListenerProxy, ListenerStats, ProxyContext, ProxyError, ProxyStatus,
        SenderOptions, SenderProxy,
    };
    pub use crate::traits::{ManagedProxy, ProcessorPlugin};
    pub use crate::transport::memory::{MemoryBroker, MemoryConnector};
    pub use crate::transport::{
        build_connections, AddressResolver, BrokerConnection, ConnectParams, ConnectionListener,
        ConnectionMap, Connector, Endpoint, Headers, MessageFrame, ResolveError, StaticResolver,
        SystemResolver, TransportError,
    };
}
