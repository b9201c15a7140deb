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

//! Integration tests for message buffers and the buffer registry.

use std::sync::Arc;

use brokerlink::prelude::*;

mod setup;

/// Tests that N puts followed by N gets come back in order.
#[tokio::test]
async fn test_buffer_is_fifo() {
    setup::initialize_tracing();
    let buffer: MessageBuffer<usize> = MessageBuffer::new("fifo");
    for i in 0..500 {
        buffer.put(i);
    }
    assert_eq!(buffer.size(), 500);
    let drained: Vec<usize> = std::iter::from_fn(|| buffer.get()).collect();
    assert_eq!(drained, (0..500).collect::<Vec<_>>());
}

/// Tests that reading an empty buffer returns `None` without blocking, repeatedly.
#[tokio::test]
async fn test_empty_get_never_blocks() {
    let buffer: MessageBuffer<String> = MessageBuffer::new("empty");
    for _ in 0..10 {
        assert!(buffer.get().is_none());
    }
    assert!(buffer.is_empty());
}

/// Tests that every lookup of one name yields the same buffer, even from many tasks.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registry_returns_one_buffer_per_name() -> anyhow::Result<()> {
    let registry: BufferRegistry<u32> = BufferRegistry::new();
    let mut tasks = Vec::new();
    for i in 0..16u32 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            let buffer = registry.get_or_create("shared");
            buffer.put(i);
            buffer
        }));
    }
    let mut buffers = Vec::new();
    for task in tasks {
        buffers.push(task.await?);
    }
    let first = &buffers[0];
    assert!(buffers.iter().all(|b| Arc::ptr_eq(b, first)));
    assert_eq!(first.size(), 16);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.sizes().get("shared"), Some(&16));
    Ok(())
}
