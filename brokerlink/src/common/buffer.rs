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

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::message::MessageEnvelope;

/// A named FIFO of received-but-unprocessed items.
///
/// `put` never blocks and never drops; `get` never blocks and returns `None`
/// when the buffer is empty. The queue carries its own lock, so steady-state
/// traffic never touches the registry.
pub struct MessageBuffer<T = MessageEnvelope> {
    name: String,
    fifo: Mutex<VecDeque<T>>,
}

impl<T> MessageBuffer<T> {
    /// Creates an empty buffer.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fifo: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue name this buffer serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends an item.
    pub fn put(&self, item: T) {
        self.fifo.lock().push_back(item);
    }

    /// Pops the oldest item, if any.
    pub fn get(&self) -> Option<T> {
        self.fifo.lock().pop_front()
    }

    /// Instantaneous depth.
    pub fn size(&self) -> usize {
        self.fifo.lock().len()
    }

    /// Whether the buffer currently holds nothing.
    pub fn is_empty(&self) -> bool {
        self.fifo.lock().is_empty()
    }
}

impl<T> fmt::Debug for MessageBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("name", &self.name)
            .field("size", &self.size())
            .finish()
    }
}

/// Owns one [`MessageBuffer`] per queue name.
///
/// Cloning the registry shares the underlying map, so a clone handed to a
/// listener proxy and a clone held by a worker observe the same buffers.
/// Buffers are created lazily and live as long as the registry.
pub struct BufferRegistry<T = MessageEnvelope> {
    buffers: Arc<DashMap<String, Arc<MessageBuffer<T>>>>,
}

impl<T> BufferRegistry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            buffers: Arc::new(DashMap::new()),
        }
    }

    /// Returns the buffer for `name`, creating it on first reference.
    ///
    /// The lookup and insert happen under the same shard lock, so concurrent
    /// callers always receive the identical instance.
    pub fn get_or_create(&self, name: &str) -> Arc<MessageBuffer<T>> {
        self.buffers
            .entry(name.to_string())
            .or_insert_with(|| {
                trace!(queue = name, "creating message buffer");
                Arc::new(MessageBuffer::new(name))
            })
            .value()
            .clone()
    }

    /// Returns the buffer for `name` if it was ever created.
    pub fn get(&self, name: &str) -> Option<Arc<MessageBuffer<T>>> {
        self.buffers.get(name).map(|entry| entry.value().clone())
    }

    /// Names of every buffer created so far, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buffers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Depth of every buffer, for monitoring.
    pub fn sizes(&self) -> BTreeMap<String, usize> {
        self.buffers
            .iter()
            .map(|e| (e.key().clone(), e.value().size()))
            .collect()
    }

    /// Number of buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffer has been created yet.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl<T> Default for BufferRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BufferRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            buffers: Arc::clone(&self.buffers),
        }
    }
}

impl<T> fmt::Debug for BufferRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("buffers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_on_empty_returns_none_repeatedly() {
        let buffer: MessageBuffer<u32> = MessageBuffer::new("empty");
        for _ in 0..1_000 {
            assert!(buffer.get().is_none());
        }
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn registry_hands_out_identical_instances() {
        let registry: BufferRegistry<u32> = BufferRegistry::new();
        let first = registry.get_or_create("q");
        let second = registry.clone().get_or_create("q");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        first.put(7);
        assert_eq!(registry.sizes().get("q"), Some(&1));
    }
}
