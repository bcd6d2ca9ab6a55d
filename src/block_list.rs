// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Tracks how often keys occur over a range of time buckets in order to
/// perform windowed lookback sampling. The list operates on monotonically
/// increasing indexes instead of timestamps: a singly linked list of
/// blocks, newest first, each holding a frequency map for one index.
pub(crate) trait BlockList: Send + Sync {
    /// Adds `count` occurrences of `key` at the bucket for `key_index`,
    /// creating the bucket if needed.
    fn increment_key(&self, key: &str, key_index: i64, count: u64) -> Result<()>;

    /// Returns the summed frequency map for the window
    /// `(current_index - 1 - lookback_index, current_index - 1]` and drops
    /// buckets that have fallen out of it.
    fn aggregate_counts(&self, current_index: i64, lookback_index: i64) -> HashMap<String, u64>;
}

struct Block {
    /// MUST be monotonically increasing from tail to head.
    index: i64,
    key_to_count: HashMap<String, u64>,
    next: Option<Box<Block>>,
}

fn sentinel() -> Block {
    Block {
        index: i64::MAX,
        key_to_count: HashMap::new(),
        next: None,
    }
}

fn do_increment(head: &mut Block, key: &str, key_index: i64, count: u64) {
    // a block matching key_index exists; just bump the key there
    if let Some(front) = head.next.as_deref_mut() {
        if front.index == key_index {
            *front.key_to_count.entry(key.to_string()).or_insert(0) += count;
            return;
        }
    }

    let mut block = Block {
        index: key_index,
        key_to_count: HashMap::new(),
        next: head.next.take(),
    };
    block.key_to_count.insert(key.to_string(), count);
    head.next = Some(Box::new(block));
}

fn do_aggregation(head: &mut Block, current_index: i64, lookback_index: i64) -> HashMap<String, u64> {
    let mut aggregate: HashMap<String, u64> = HashMap::new();

    // aggregate (finish, start], then drop everything at or before finish
    let start_index = current_index - 1;
    let finish_index = start_index - lookback_index;

    let mut front = head;
    loop {
        if front.index <= start_index {
            for (key, count) in &front.key_to_count {
                *aggregate.entry(key.clone()).or_insert(0) += count;
            }
        }
        // never drop the sentinel
        if front
            .next
            .as_deref()
            .is_some_and(|next| next.index <= finish_index)
        {
            front.next = None;
            break;
        }
        match front.next.as_deref_mut() {
            Some(next) => front = next,
            None => break,
        }
    }

    aggregate
}

/// A block list with no limit on the number of distinct keys.
pub(crate) struct UnboundedBlockList {
    head: Mutex<Block>,
}

impl UnboundedBlockList {
    pub fn new() -> Self {
        UnboundedBlockList {
            head: Mutex::new(sentinel()),
        }
    }
}

impl BlockList for UnboundedBlockList {
    fn increment_key(&self, key: &str, key_index: i64, count: u64) -> Result<()> {
        let mut head = self.head.lock().unwrap();
        do_increment(&mut head, key, key_index, count);
        Ok(())
    }

    fn aggregate_counts(&self, current_index: i64, lookback_index: i64) -> HashMap<String, u64> {
        let mut head = self.head.lock().unwrap();
        do_aggregation(&mut head, current_index, lookback_index)
    }
}

/// A block list with a hard cap on the number of distinct keys tracked.
/// New keys beyond the cap are rejected; keys already tracked keep
/// counting. The cap is enforced with a map from key to the (newest-first)
/// indexes the key appears in, pruned on every aggregation.
pub(crate) struct BoundedBlockList {
    inner: Mutex<BoundedInner>,
    max_keys: usize,
}

struct BoundedInner {
    head: Block,
    key_to_indexes: HashMap<String, Vec<i64>>,
}

impl BoundedBlockList {
    pub fn new(max_keys: usize) -> Self {
        BoundedBlockList {
            inner: Mutex::new(BoundedInner {
                head: sentinel(),
                key_to_indexes: HashMap::new(),
            }),
            max_keys,
        }
    }
}

impl BlockList for BoundedBlockList {
    fn increment_key(&self, key: &str, key_index: i64, count: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        if let Some(indexes) = inner.key_to_indexes.get_mut(key) {
            if indexes.first() != Some(&key_index) {
                indexes.insert(0, key_index);
            }
        } else if inner.key_to_indexes.len() < self.max_keys {
            inner.key_to_indexes.insert(key.to_string(), vec![key_index]);
        } else {
            return Err(Error::MaxKeysExceeded {
                key: key.to_string(),
            });
        }

        do_increment(&mut inner.head, key, key_index, count);
        Ok(())
    }

    fn aggregate_counts(&self, current_index: i64, lookback_index: i64) -> HashMap<String, u64> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let aggregate = do_aggregation(&mut inner.head, current_index, lookback_index);

        let start_index = current_index - 1;
        let finish_index = start_index - lookback_index;

        // prune expired indexes; a key with nothing left in the window is
        // forgotten entirely, freeing its capacity slot
        inner.key_to_indexes.retain(|_, indexes| {
            if let Some(drop_at) = indexes.iter().position(|&index| index <= finish_index) {
                indexes.truncate(drop_at);
            }
            !indexes.is_empty()
        });

        aggregate
    }
}
