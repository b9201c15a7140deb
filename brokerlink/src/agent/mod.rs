//! The processing agent and everything it is built from.
//!
//! *   [`AgentConfig`]: the JSON agent document.
//! *   [`PluginRegistry`]: `module.name` keys to plugin constructors.
//! *   [`ProcessingAgent`]: setup, start, guard and passive mode.
//! *   [`WorkerStrategy`] and [`ProcessorStats`]: how plugins are driven and what they did.

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

pub use config::{AgentConfig, ConfigError, ProcessorConfig, QueueConfig, ServerConfig};
pub use plugin::{PluginConstructor, PluginRegistry};
pub use processing_agent::{AgentHandle, InitializeHook, ProcessingAgent, ProxySet};
pub use worker::{ProcessorStats, WorkerStrategy};

/// The JSON agent document.
mod config;
/// Plugin constructor registry.
mod plugin;
/// Agent setup, main loop and shutdown.
mod processing_agent;
/// Processor workers.
mod worker;
