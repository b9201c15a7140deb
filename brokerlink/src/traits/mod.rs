//! Traits at the seams between the framework and the code built on it.
//!
//! *   [`ProcessorPlugin`]: user processing logic, driven by a worker.
//! *   [`ManagedProxy`]: the lifecycle surface the agent's guard uses for
//!     listener and sender proxies alike.

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

pub use managed_proxy::ManagedProxy;
pub use processor_plugin::ProcessorPlugin;

/// Defines the [`ManagedProxy`] trait.
mod managed_proxy;
/// Defines the [`ProcessorPlugin`] trait.
mod processor_plugin;
