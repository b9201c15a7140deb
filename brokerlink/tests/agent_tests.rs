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

//! Integration tests for agent setup, validation, passive mode and shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use brokerlink::prelude::*;
use serde_json::json;

mod setup;

fn document(processors: serde_json::Value) -> AgentConfig {
    let doc = json!({
        "mb_servers": {
            "mb1": { "host_port_list": ["mb1:61613"], "use_ssl": false }
        },
        "queues": {
            "A": { "server": "mb1", "destination": "/queue/A" },
            "B": { "server": "mb1", "destination": "/queue/B" },
            "C": { "server": "mb1", "destination": "/queue/C" },
            "off": { "server": "mb1", "destination": "/queue/off", "enable": false }
        },
        "processors": processors
    });
    serde_json::from_value(doc).expect("valid agent document")
}

fn agent(broker: &MemoryBroker, processors: serde_json::Value) -> ProcessingAgent {
    ProcessingAgent::new(
        document(processors),
        setup::test_plugins(),
        setup::memory_context(broker),
    )
}

/// Echoes bodies, but panics on `boom`.
struct PanicsOnBoom;

#[async_trait]
impl ProcessorPlugin for PanicsOnBoom {
    async fn process(
        &mut self,
        message: Option<&MessageEnvelope>,
    ) -> anyhow::Result<Option<String>> {
        let body = message.map(|m| m.body().to_string());
        assert_ne!(body.as_deref(), Some("boom"), "cannot handle boom");
        Ok(body)
    }
}

/// Echoes bodies after a pause, flagging when it starts and finishes.
struct Slow {
    started: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl ProcessorPlugin for Slow {
    async fn process(
        &mut self,
        message: Option<&MessageEnvelope>,
    ) -> anyhow::Result<Option<String>> {
        let Some(message) = message else {
            return Ok(None);
        };
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(Some(message.body().to_string()))
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Tests that processors with the same output queue share one sender.
#[tokio::test]
async fn test_shared_output_queue_shares_sender() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let broker = MemoryBroker::new();
    let mut agent = agent(
        &broker,
        json!({
            "p1": { "module": "test", "name": "Echo", "in_queue": "A", "out_queue": "C" },
            "p2": { "module": "test", "name": "Echo", "in_queue": "B", "out_queue": "C" },
            "idle": { "module": "test", "name": "Echo", "in_queue": "A", "enable": false }
        }),
    );
    agent.setup().await?;

    let s1 = agent.processor_sender("p1").expect("p1 sender");
    let s2 = agent.processor_sender("p2").expect("p2 sender");
    assert!(Arc::ptr_eq(&s1, &s2));
    assert!(Arc::ptr_eq(&s1, &agent.sender("C").expect("sender for C")));

    let proxies = agent.proxies().expect("set up");
    assert_eq!(proxies.listeners.keys().collect::<Vec<_>>(), vec!["A", "B"]);
    assert_eq!(proxies.senders.keys().collect::<Vec<_>>(), vec!["C"]);
    assert!(agent.processor_listener("idle").is_none());
    Ok(())
}

/// Tests that broken documents are rejected before anything connects.
#[tokio::test]
async fn test_invalid_documents_fail_setup() {
    let cases = [
        (
            json!({ "p": { "module": "test", "name": "Echo", "in_queue": "nope" } }),
            "unknown queue",
        ),
        (
            json!({ "p": { "module": "test", "name": "Echo", "out_queue": "off" } }),
            "disabled queue",
        ),
        (
            json!({ "p": { "module": "test", "name": "Missing", "in_queue": "A" } }),
            "unknown plugin",
        ),
        (
            json!({ "p": { "module": "test", "name": "Echo", "in_queue": "A", "strategy": "multi" } }),
            "unsupported strategy",
        ),
    ];
    for (processors, label) in cases {
        let broker = MemoryBroker::new();
        let mut agent = agent(&broker, processors);
        let err = agent.setup().await.expect_err(label);
        let matched = match label {
            "unknown queue" => matches!(err, ConfigError::UnknownQueue { .. }),
            "disabled queue" => matches!(err, ConfigError::DisabledQueue { .. }),
            "unknown plugin" => matches!(err, ConfigError::UnknownPlugin { .. }),
            _ => matches!(
                err,
                ConfigError::UnsupportedStrategy {
                    strategy: WorkerStrategy::Multi,
                    ..
                }
            ),
        };
        assert!(matched, "{label}: {err}");
        assert!(agent.proxies().is_none());
        assert_eq!(broker.connections_created(), 0, "{label}");
    }
}

/// Tests that a queue naming an unknown server is rejected.
#[tokio::test]
async fn test_unknown_server_is_rejected() {
    let mut config = document(json!({}));
    config.queues.insert(
        "Z".into(),
        serde_json::from_value(json!({ "server": "mb9", "destination": "/queue/Z" }))
            .expect("queue config"),
    );
    let err = config
        .validate(&setup::test_plugins())
        .expect_err("unknown server");
    assert!(matches!(err, ConfigError::UnknownServer { .. }));
}

/// Tests that a disabled queue may still name a retired server.
#[tokio::test]
async fn test_disabled_queue_server_is_not_checked() -> anyhow::Result<()> {
    let mut config = document(json!({
        "p": { "module": "test", "name": "Echo", "in_queue": "A" }
    }));
    config.queues.insert(
        "retired".into(),
        serde_json::from_value(
            json!({ "server": "gone", "destination": "/queue/retired", "enable": false }),
        )?,
    );
    config.validate(&setup::test_plugins())?;
    Ok(())
}

/// Tests that passive mode reports a missing queue by name alone.
#[tokio::test]
async fn test_passive_mode_rejects_unknown_queue() {
    let broker = MemoryBroker::new();
    let agent = agent(&broker, json!({}));
    let err = agent
        .start_passive_mode(Some(vec!["nope".to_string()]), Some(Vec::new()), None)
        .await
        .expect_err("unknown queue");
    assert!(matches!(&err, ConfigError::QueueNotFound(queue) if queue == "nope"), "{err}");
    assert_eq!(err.to_string(), "unknown queue nope");
    assert_eq!(broker.connections_created(), 0);
}

/// Tests that passive mode builds and connects proxies without workers.
#[tokio::test]
async fn test_passive_mode_builds_selected_proxies() -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let agent = agent(&broker, json!({}));
    let proxies = agent
        .start_passive_mode(Some(vec!["A".to_string()]), None, None)
        .await?;

    assert_eq!(proxies.listeners.keys().collect::<Vec<_>>(), vec!["A"]);
    assert_eq!(
        proxies.senders.keys().collect::<Vec<_>>(),
        vec!["A", "B", "C"]
    );
    let listener = &proxies.listeners["A"];
    assert_eq!(listener.options().prefetch_size, Some(100));
    assert_eq!(broker.subscriptions("/queue/A"), 1);
    assert_eq!(broker.connected_sessions(), 4);

    proxies.senders["A"].send("loopback").await?;
    assert_eq!(listener.buffer().size(), 1);
    proxies.stop().await;
    assert_eq!(broker.connected_sessions(), 0);
    Ok(())
}

/// Tests that the initialize hook runs after setup and before proxies connect.
#[tokio::test]
async fn test_initialize_hook_runs_before_connecting() -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let ran = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&ran);
    let agent = agent(
        &broker,
        json!({ "p": { "module": "test", "name": "Echo", "in_queue": "A", "out_queue": "B" } }),
    )
    .with_initialize_hook(move |proxies| async move {
        assert_eq!(proxies.listeners.len(), 1);
        assert_eq!(proxies.listeners["A"].connection_ids().len(), 1);
        observed.store(true, Ordering::SeqCst);
        Ok(())
    });
    assert_eq!(broker.connected_sessions(), 0);

    let handle = agent.start().await?;
    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(broker.connected_sessions(), 2);
    handle.shutdown().await?;
    Ok(())
}

/// Tests that a failing processor's message is dead-lettered after the configured deliveries.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_processor_dead_letters() -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let mut config = document(json!({
        "bad": { "module": "test", "name": "Failing", "in_queue": "A" }
    }));
    config.redelivery = Some(RedeliveryPolicy::bounded(2).with_dead_letter("/queue/dead"));
    if let Some(queue) = config.queues.get_mut("A") {
        queue.use_transaction = Some(false);
    }
    let agent = ProcessingAgent::new(config, setup::test_plugins(), setup::memory_context(&broker));
    let handle = agent.start().await?;

    let stats = handle.processor_stats("bad").expect("stats for bad");
    broker.publish("/queue/A", "poison");
    assert!(wait_for(|| broker.depth("/queue/dead") == 1 && stats.failures() == 2).await);
    assert_eq!(stats.messages_processed(), 0);

    handle.shutdown().await?;
    assert_eq!(broker.drain("/queue/dead"), vec!["poison"]);
    Ok(())
}

/// Tests guard repair of a started agent and the shutdown order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_started_agent_recovers_and_shuts_down() -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let agent = agent(
        &broker,
        json!({ "p": { "module": "test", "name": "Echo", "in_queue": "A", "out_queue": "B" } }),
    );
    let handle = agent.start().await?;
    assert_eq!(handle.processor_names(), vec!["p"]);

    broker.sever_all();
    assert_eq!(handle.guard_now().await, 2);
    assert_eq!(broker.connected_sessions(), 2);
    for status in handle
        .proxies()
        .listeners
        .values()
        .map(|l| l.status())
        .chain(handle.proxies().senders.values().map(|s| s.status()))
    {
        assert_eq!(status.restarts, 1, "{}", status.name);
        assert!(!status.got_disconnected);
    }

    handle.shutdown().await?;
    assert_eq!(broker.connected_sessions(), 0);
    Ok(())
}

/// Tests that a panicking plugin fails its message and the worker keeps processing.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_plugin_does_not_stop_worker() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let broker = MemoryBroker::new();
    let plugins = setup::test_plugins();
    plugins.register("test", "PanicsOnBoom", |_| Ok(Box::new(PanicsOnBoom)));
    let config = document(json!({
        "p": { "module": "test", "name": "PanicsOnBoom", "in_queue": "A", "out_queue": "B" }
    }));
    let handle = ProcessingAgent::new(config, plugins, setup::memory_context(&broker))
        .start()
        .await?;

    let stats = handle.processor_stats("p").expect("stats for p");
    broker.publish("/queue/A", "boom");
    assert!(wait_for(|| stats.failures() == 1).await);
    broker.publish("/queue/A", "ok");
    assert!(wait_for(|| stats.messages_processed() == 1 && stats.results_sent() == 1).await);

    handle.shutdown().await?;
    assert_eq!(broker.drain("/queue/B"), vec!["ok"]);
    Ok(())
}

/// Tests that shutdown lets an in-flight iteration run to completion.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_current_iteration() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let broker = MemoryBroker::new();
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let plugins = setup::test_plugins();
    let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
    plugins.register("test", "Slow", move |_| {
        Ok(Box::new(Slow {
            started: Arc::clone(&s),
            finished: Arc::clone(&f),
        }))
    });
    let config = document(json!({
        "p": { "module": "test", "name": "Slow", "in_queue": "A", "out_queue": "B" }
    }));
    let handle = ProcessingAgent::new(config, plugins, setup::memory_context(&broker))
        .start()
        .await?;

    broker.publish("/queue/A", "slow");
    assert!(wait_for(|| started.load(Ordering::SeqCst)).await);
    assert!(!finished.load(Ordering::SeqCst));

    handle.shutdown().await?;
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(broker.drain("/queue/B"), vec!["slow"]);
    assert_eq!(broker.connected_sessions(), 0);
    Ok(())
}
