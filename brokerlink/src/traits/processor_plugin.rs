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

use crate::message::MessageEnvelope;

/// User processing logic run by a processor worker.
///
/// A worker owns its plugin exclusively, so `&mut self` is available for
/// per-plugin state. For every message the worker acquires the envelope, calls
/// [`process`](Self::process) and completes the message with the outcome:
/// `Ok` acknowledges, `Err` rejects. An `Ok(Some(text))` result is published
/// to the processor's output queue when one is configured.
///
/// `process` may also be called with `None`, for plugins that act without an
/// input queue.
///
/// # Example
///
/// ```rust,ignore
/// struct Upper;
///
/// #[async_trait]
/// impl ProcessorPlugin for Upper {
///     async fn process(&mut self, message: Option<&MessageEnvelope>) -> anyhow::Result<Option<String>> {
///         Ok(message.map(|m| m.body().to_uppercase()))
///     }
/// }
/// ```
#[async_trait]
pub trait ProcessorPlugin: Send {
    /// Runs once before the first `process` call.
    async fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handles one message.
    async fn process(&mut self, message: Option<&MessageEnvelope>)
        -> anyhow::Result<Option<String>>;
}
