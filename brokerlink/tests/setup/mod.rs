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
use std::sync::{Arc, Once};

use brokerlink::prelude::*;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Ensures tracing initialization happens only once across all tests.
static INIT: Once = Once::new();

/// Initializes the global tracing subscriber for tests, writing to `logs/brokerlink_tests.txt`.
pub fn initialize_tracing() {
    INIT.call_once(|| {
        std::fs::create_dir_all("logs").expect("could not create logs dir");

        let file_appender =
            RollingFileAppender::new(Rotation::NEVER, "logs", "brokerlink_tests.txt");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Leak the guard so the non-blocking writer is not dropped before process exit
        Box::leak(Box::new(guard));

        let filter = EnvFilter::new("trace")
            .add_directive("brokerlink=trace".parse().unwrap())
            .add_directive("tokio=info".parse().unwrap());

        let subscriber = FmtSubscriber::builder()
            .with_span_events(FmtSpan::NONE)
            .with_max_level(Level::TRACE)
            .compact()
            .with_line_number(true)
            .without_time()
            .with_target(true)
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");
    });
}

/// A proxy context over `broker`, resolving `mb1` to one node and `cluster`
/// to three.
pub fn memory_context(broker: &MemoryBroker) -> ProxyContext {
    let resolver = StaticResolver::new()
        .with_host("mb1", ["node1.example.org"])
        .with_host(
            "cluster",
            ["node1.example.org", "node2.example.org", "node3.example.org"],
        );
    ProxyContext::new(Arc::new(resolver), Arc::new(broker.connector()))
}

/// Returns each message body unchanged.
pub struct Echo;

#[async_trait]
impl ProcessorPlugin for Echo {
    async fn process(
        &mut self,
        message: Option<&MessageEnvelope>,
    ) -> anyhow::Result<Option<String>> {
        Ok(message.map(|m| m.body().to_string()))
    }
}

/// Fails on every message.
pub struct Failing;

#[async_trait]
impl ProcessorPlugin for Failing {
    async fn process(
        &mut self,
        message: Option<&MessageEnvelope>,
    ) -> anyhow::Result<Option<String>> {
        anyhow::bail!(
            "refusing {}",
            message.map_or("nothing", MessageEnvelope::message_id)
        )
    }
}

/// A registry with `test.Echo` and `test.Failing`.
pub fn test_plugins() -> PluginRegistry {
    let plugins = PluginRegistry::new();
    plugins.register("test", "Echo", |_| Ok(Box::new(Echo)));
    plugins.register("test", "Failing", |_| Ok(Box::new(Failing)));
    plugins
}
