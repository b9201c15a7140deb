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

//! End-to-end: a sender feeds queue A, an echo processor forwards A to B, and
//! a capturing listener on B must see every message exactly once.

use std::collections::BTreeSet;
use std::time::Duration;

use brokerlink::prelude::*;
use serde_json::json;

mod setup;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo_pipeline_delivers_every_message_once() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let broker = MemoryBroker::new();
    let config: AgentConfig = serde_json::from_value(json!({
        "mb_servers": { "mb1": { "host_port_list": ["mb1:61613"] } },
        "queues": {
            "A": { "server": "mb1", "destination": "/queue/A" },
            "B": { "server": "mb1", "destination": "/queue/B" }
        },
        "processors": {
            "echo": { "module": "test", "name": "Echo", "in_queue": "A", "out_queue": "B" }
        }
    }))?;
    let agent = ProcessingAgent::new(config, setup::test_plugins(), setup::memory_context(&broker));
    let handle = agent.start().await?;

    let context = setup::memory_context(&broker);
    let capture = ListenerProxy::new(
        "B-capture",
        "/queue/B",
        &["mb1:61613".to_string()],
        ListenerOptions::default().with_skip_buffer(true),
        &context,
    )
    .await?;
    capture.go().await?;
    let sender = SenderProxy::new(
        "A-feed",
        "/queue/A",
        &["mb1:61613".to_string()],
        SenderOptions::default(),
        &context,
    )
    .await?;
    sender.go().await?;

    for i in 0..20 {
        sender.send(&format!("A{i}")).await?;
    }

    let mut waited = Duration::ZERO;
    while capture.captured().len() < 20 && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    // Give any duplicate a chance to show up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let captured = capture.take_captured();
    assert_eq!(captured.len(), 20, "{captured:?}");
    let distinct: BTreeSet<String> = captured.into_iter().collect();
    let expected: BTreeSet<String> = (0..20).map(|i| format!("A{i}")).collect();
    assert_eq!(distinct, expected);

    let stats = handle.processor_stats("echo").expect("echo stats");
    assert_eq!(stats.messages_processed(), 20);
    assert_eq!(stats.results_sent(), 20);

    sender.stop().await;
    capture.stop().await;
    handle.shutdown().await?;
    assert_eq!(broker.in_flight(), 0);
    Ok(())
}
