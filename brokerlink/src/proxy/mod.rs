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

//! Listener and sender proxies.
//!
//! A proxy owns the broker connections for one destination. Both kinds share
//! the same disconnect bookkeeping: `got_disconnected` is raised by the
//! connection's disconnect callback, `to_disconnect` marks an intentional stop,
//! and the restart counter only ever grows.

use std::fmt;
use std::sync::Arc;

pub use error::ProxyError;
pub(crate) use listener::ListenerInner;
pub use listener::{ListenerOptions, ListenerProxy, ListenerStats};
pub use sender::{SenderOptions, SenderProxy};
pub use state::ProxyStatus;

use crate::common::BufferRegistry;
use crate::transport::{AddressResolver, Connector, SystemResolver};

mod error;
mod listener;
mod sender;
mod state;

/// Collaborators every proxy needs: address resolution, connection
/// construction and the buffer registry listeners deposit into.
#[derive(Clone)]
pub struct ProxyContext {
    /// Resolves and canonicalizes broker host names.
    pub resolver: Arc<dyn AddressResolver>,
    /// Builds broker connections.
    pub connector: Arc<dyn Connector>,
    /// Buffers shared by listeners and processor workers.
    pub buffers: BufferRegistry,
}

impl ProxyContext {
    /// Creates a context with a fresh buffer registry.
    pub fn new(resolver: Arc<dyn AddressResolver>, connector: Arc<dyn Connector>) -> Self {
        Self {
            resolver,
            connector,
            buffers: BufferRegistry::new(),
        }
    }

    /// Creates a context resolving through the operating system.
    pub fn with_system_resolver(connector: Arc<dyn Connector>) -> Self {
        Self::new(Arc::new(SystemResolver), connector)
    }

    /// Replaces the buffer registry.
    #[must_use]
    pub fn with_buffers(mut self, buffers: BufferRegistry) -> Self {
        self.buffers = buffers;
        self
    }
}

impl fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyContext")
            .field("buffers", &self.buffers)
            .finish_non_exhaustive()
    }
}
