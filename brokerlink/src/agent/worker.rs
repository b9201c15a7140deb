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

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};

use crate::common::MessageBuffer;
use crate::message::MessageEnvelope;
use crate::proxy::SenderProxy;
use crate::traits::ProcessorPlugin;

/// How a processor's plugin is driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStrategy {
    /// One message per iteration on a single task.
    #[default]
    Simple,
    /// Several messages per iteration. Not available; rejected at setup.
    Multi,
}

impl fmt::Display for WorkerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => f.write_str("simple"),
            Self::Multi => f.write_str("multi"),
        }
    }
}

/// Counters of one processor worker.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    /// Loop iterations.
    pub iterations: AtomicUsize,
    /// Plugin calls that returned `Ok`.
    pub messages_processed: AtomicUsize,
    /// Plugin calls that returned `Err` or panicked, plus envelopes that could not be acquired.
    pub failures: AtomicUsize,
    /// Results published to the output queue.
    pub results_sent: AtomicUsize,
}

impl ProcessorStats {
    /// Get the number of loop iterations.
    #[must_use]
    pub fn iterations(&self) -> usize {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Get the number of successful plugin calls.
    #[must_use]
    pub fn messages_processed(&self) -> usize {
        self.messages_processed.load(Ordering::Relaxed)
    }

    /// Get the number of failures.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get the number of results sent.
    #[must_use]
    pub fn results_sent(&self) -> usize {
        self.results_sent.load(Ordering::Relaxed)
    }
}

/// A plugin plus the queues it is bound to, ready to run.
pub(crate) struct ProcessorWorker {
    pub(crate) name: String,
    pub(crate) plugin: Box<dyn ProcessorPlugin>,
    pub(crate) buffer: Option<Arc<MessageBuffer>>,
    pub(crate) sender: Option<Arc<SenderProxy>>,
    pub(crate) verbose: bool,
    pub(crate) sleep: Duration,
}

/// A running worker.
pub(crate) struct WorkerHandle {
    pub(crate) name: String,
    pub(crate) token: CancellationToken,
    pub(crate) handle: JoinHandle<()>,
    pub(crate) stats: Arc<ProcessorStats>,
}

impl ProcessorWorker {
    pub(crate) fn spawn(self) -> WorkerHandle {
        let token = CancellationToken::new();
        let stats = Arc::new(ProcessorStats::default());
        let name = self.name.clone();
        let handle = tokio::spawn(self.run(token.clone(), Arc::clone(&stats)));
        WorkerHandle {
            name,
            token,
            handle,
            stats,
        }
    }

    #[instrument(skip_all, fields(processor = %self.name))]
    async fn run(mut self, token: CancellationToken, stats: Arc<ProcessorStats>) {
        if let Err(e) = self.plugin.initialize().await {
            error!("plugin initialize failed ; {:#}", e);
            return;
        }
        debug!("looping");
        while !token.is_cancelled() {
            self.iterate(&stats).await;
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(self.sleep) => {}
            }
        }
        info!("worker stopped");
    }

    async fn iterate(&mut self, stats: &ProcessorStats) {
        stats.iterations.fetch_add(1, Ordering::Relaxed);
        let result = match self.buffer.clone() {
            Some(buffer) => match buffer.get() {
                Some(envelope) => self.handle_envelope(envelope, stats).await,
                None => return,
            },
            None => match call_plugin(self.plugin.as_mut(), None).await {
                Ok(result) => {
                    stats.messages_processed.fetch_add(1, Ordering::Relaxed);
                    result
                }
                Err(e) => {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                    error!("process failed ; {:#}", e);
                    None
                }
            },
        };
        let (Some(text), Some(sender)) = (result, self.sender.as_ref()) else {
            return;
        };
        match sender.send(&text).await {
            Ok(()) => {
                stats.results_sent.fetch_add(1, Ordering::Relaxed);
                if self.verbose {
                    debug!("sent result to {}", sender.destination());
                }
            }
            Err(e) => error!("failed to send result to {} ; {}", sender.destination(), e),
        }
    }

    /// Runs the plugin inside the envelope's scope; the result is only
    /// returned when the envelope settled successfully.
    async fn handle_envelope(
        &mut self,
        envelope: MessageEnvelope,
        stats: &ProcessorStats,
    ) -> Option<String> {
        let msg_id = envelope.message_id().to_string();
        let acquired = match envelope.acquire().await {
            Ok(acquired) => acquired,
            Err(e) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                error!(%msg_id, "failed to acquire message ; {}", e);
                return None;
            }
        };
        if self.verbose {
            trace!(%msg_id, "processing");
        }
        let result = call_plugin(self.plugin.as_mut(), Some(acquired.message())).await;
        let completion = acquired.complete(result.is_ok()).await;

        let output = match result {
            Ok(output) => {
                stats.messages_processed.fetch_add(1, Ordering::Relaxed);
                output
            }
            Err(e) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                error!(%msg_id, "failed to process message ; {:#}", e);
                None
            }
        };
        match completion {
            Ok(outcome) => {
                if self.verbose {
                    debug!(%msg_id, %outcome, "message settled");
                }
                output
            }
            Err(e) => {
                error!(%msg_id, "failed to settle message ; {}", e);
                None
            }
        }
    }
}

/// Calls the plugin, turning a panic into an error so the worker keeps looping.
async fn call_plugin(
    plugin: &mut dyn ProcessorPlugin,
    message: Option<&MessageEnvelope>,
) -> anyhow::Result<Option<String>> {
    match AssertUnwindSafe(plugin.process(message)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!(
            "plugin panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    struct Counter(usize);

    #[async_trait]
    impl ProcessorPlugin for Counter {
        async fn process(
            &mut self,
            message: Option<&MessageEnvelope>,
        ) -> anyhow::Result<Option<String>> {
            assert!(message.is_none());
            self.0 += 1;
            Ok(None)
        }
    }

    struct Flaky(usize);

    #[async_trait]
    impl ProcessorPlugin for Flaky {
        async fn process(
            &mut self,
            _message: Option<&MessageEnvelope>,
        ) -> anyhow::Result<Option<String>> {
            self.0 += 1;
            if self.0 == 2 {
                panic!("tick {}", self.0);
            }
            Ok(None)
        }
    }

    #[test]
    fn strategy_names() {
        let parsed: WorkerStrategy = serde_json::from_str("\"multi\"").unwrap();
        assert_eq!(parsed, WorkerStrategy::Multi);
        assert_eq!(WorkerStrategy::default().to_string(), "simple");
    }

    #[tokio::test]
    async fn worker_without_input_queue_runs_until_cancelled() {
        let worker = ProcessorWorker {
            name: "tick".into(),
            plugin: Box::new(Counter(0)),
            buffer: None,
            sender: None,
            verbose: false,
            sleep: Duration::from_millis(1),
        };
        let running = worker.spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;
        running.token.cancel();
        running.handle.await.unwrap();

        let iterations = running.stats.iterations();
        assert!(iterations > 0);
        assert_eq!(running.stats.messages_processed(), iterations);
        assert_eq!(running.stats.failures(), 0);
    }

    #[tokio::test]
    async fn panicking_plugin_counts_as_failure_and_loop_continues() {
        let worker = ProcessorWorker {
            name: "flaky".into(),
            plugin: Box::new(Flaky(0)),
            buffer: None,
            sender: None,
            verbose: false,
            sleep: Duration::from_millis(1),
        };
        let running = worker.spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;
        running.token.cancel();
        running.handle.await.unwrap();

        assert_eq!(running.stats.failures(), 1);
        assert!(running.stats.messages_processed() >= 1);
        assert_eq!(
            running.stats.iterations(),
            running.stats.messages_processed() + 1
        );
    }

    #[test]
    fn panic_payloads_are_described() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "non-string payload");
    }
}
