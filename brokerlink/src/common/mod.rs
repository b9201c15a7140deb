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

//! Common building blocks shared by every other module.
//!
//! *   [`BufferRegistry`] and [`MessageBuffer`]: per-queue FIFOs of received envelopes.
//! *   [`BrokerlinkSettings`]: runtime tuning loaded from XDG-located TOML.
//! *   [`init_tracing`]: installs the crate's `tracing` subscriber.
//! *   Small value types: [`AckMode`], [`ConnectionMode`], [`TlsOptions`], [`Credentials`].

// --- Public Re-exports ---
pub use buffer::{BufferRegistry, MessageBuffer};
pub use config::{
    AgentSettings, BrokerlinkSettings, LoggingSettings, ProxySettings, TimeoutSettings, SETTINGS,
};
pub use logging::{host_pid_token, init_tracing};
pub(crate) use logging::local_hostname;
pub use types::*;

// --- Submodules ---

/// Acknowledgement and connection modes, TLS material and credentials.
mod types;
/// Named FIFO buffers and their registry.
mod buffer;
/// Runtime settings loaded from TOML.
pub mod config;
/// Tracing subscriber setup.
mod logging;
