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

use async_trait::async_trait;

use crate::proxy::{ListenerProxy, ProxyError, ProxyStatus, SenderProxy};

/// Lifecycle operations shared by every proxy kind.
///
/// The agent's guard only goes through this trait, so it restarts listeners
/// and senders with the same rule: a proxy needs a restart when a disconnect
/// was observed and nobody asked for it.
#[async_trait]
pub trait ManagedProxy: Send + Sync {
    /// Logical name.
    fn name(&self) -> &str;

    /// Current flags and connections.
    fn status(&self) -> ProxyStatus;

    /// Whether a disconnect has been observed since the last `go`.
    fn got_disconnected(&self) -> bool;

    /// Whether the proxy is being stopped on purpose.
    fn to_disconnect(&self) -> bool;

    /// Restarts since construction.
    fn restart_count(&self) -> u32;

    /// Connects.
    async fn go(&self) -> Result<(), ProxyError>;

    /// Disconnects.
    async fn stop(&self);

    /// Stops, rebuilds the connections and connects again.
    async fn restart(&self) -> Result<(), ProxyError>;

    /// Unexpected disconnect.
    fn needs_restart(&self) -> bool {
        self.got_disconnected() && !self.to_disconnect()
    }
}

#[async_trait]
impl ManagedProxy for ListenerProxy {
    fn name(&self) -> &str {
        ListenerProxy::name(self)
    }

    fn status(&self) -> ProxyStatus {
        ListenerProxy::status(self)
    }

    fn got_disconnected(&self) -> bool {
        ListenerProxy::got_disconnected(self)
    }

    fn to_disconnect(&self) -> bool {
        ListenerProxy::to_disconnect(self)
    }

    fn restart_count(&self) -> u32 {
        ListenerProxy::restart_count(self)
    }

    async fn go(&self) -> Result<(), ProxyError> {
        ListenerProxy::go(self).await
    }

    async fn stop(&self) {
        ListenerProxy::stop(self).await;
    }

    async fn restart(&self) -> Result<(), ProxyError> {
        ListenerProxy::restart(self).await
    }
}

#[async_trait]
impl ManagedProxy for SenderProxy {
    fn name(&self) -> &str {
        SenderProxy::name(self)
    }

    fn status(&self) -> ProxyStatus {
        SenderProxy::status(self)
    }

    fn got_disconnected(&self) -> bool {
        SenderProxy::got_disconnected(self)
    }

    fn to_disconnect(&self) -> bool {
        SenderProxy::to_disconnect(self)
    }

    fn restart_count(&self) -> u32 {
        SenderProxy::restart_count(self)
    }

    async fn go(&self) -> Result<(), ProxyError> {
        SenderProxy::go(self).await
    }

    async fn stop(&self) {
        SenderProxy::stop(self).await;
    }

    async fn restart(&self) -> Result<(), ProxyError> {
        SenderProxy::restart(self).await
    }
}
