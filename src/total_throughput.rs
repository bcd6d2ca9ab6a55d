// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::per_key_throughput::ThroughputState;
use crate::sampler::Sampler;
use crate::worker::Worker;
use crate::{Error, Result};

const DEFAULT_CLEAR_FREQUENCY: Duration = Duration::from_secs(30);
const DEFAULT_GOAL_THROUGHPUT_PER_SEC: u64 = 100;

/// Configuration for [`TotalThroughput`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TotalThroughputConfig {
    /// How often the counters reset, in seconds.
    /// DEPRECATED -- use `clear_frequency`.
    #[serde(default)]
    pub clear_frequency_sec: Option<u64>,

    /// How often the counters reset. Either this or `clear_frequency_sec`
    /// can be specified, but not both. If neither is set, the default is
    /// 30s.
    #[serde(default)]
    pub clear_frequency: Option<Duration>,

    /// The target total number of events to send per second. Sample rates
    /// are generated to squash the total throughput down to this goal;
    /// actual throughput may exceed it. Default 100.
    #[serde(default)]
    pub goal_throughput_per_sec: Option<u64>,

    /// Limits the number of distinct keys tracked within one interval.
    /// Once the limit is reached, new keys are not counted; existing keys
    /// continue to accumulate. Unbounded when unset.
    #[serde(default)]
    pub max_keys: Option<usize>,
}

impl TotalThroughputConfig {
    fn clear_frequency(&self) -> Result<Duration> {
        match (self.clear_frequency, self.clear_frequency_sec) {
            (Some(_), Some(_)) => Err(Error::DeprecatedConfig {
                field: "clear_frequency_sec",
                replacement: "clear_frequency",
            }),
            (Some(duration), None) => Ok(duration),
            (None, Some(secs)) => Ok(Duration::from_secs(secs)),
            (None, None) => Ok(DEFAULT_CLEAR_FREQUENCY),
        }
    }

    fn goal_throughput_per_sec(&self) -> u64 {
        self.goal_throughput_per_sec
            .unwrap_or(DEFAULT_GOAL_THROUGHPUT_PER_SEC)
    }
}

/// A sampler that steers toward a fixed total number of events per second,
/// split evenly across the keys seen in each interval.
///
/// When the keyspace is sharded across servers this keeps each server's
/// sent volume roughly equal. It performs poorly when the active keyspace
/// is very large: with many keys each one is reduced to roughly one event
/// per interval.
pub struct TotalThroughput {
    config: TotalThroughputConfig,
    state: Arc<Mutex<ThroughputState>>,
    worker: Worker,
}

impl TotalThroughput {
    pub fn new(config: TotalThroughputConfig) -> Self {
        TotalThroughput {
            config,
            state: Arc::new(Mutex::new(ThroughputState::default())),
            worker: Worker::new(),
        }
    }

    /// Recomputes the rate table: the interval's total goal is split
    /// across the keys seen, floored to at least one event per key, and
    /// each key's rate is its count over that share.
    fn update_maps(state: &Mutex<ThroughputState>, total_goal: f64) {
        let counts = {
            let mut state = state.lock().unwrap();
            std::mem::take(&mut state.current_counts)
        };

        let num_keys = counts.len();
        if num_keys == 0 {
            // no traffic during the last interval
            state.lock().unwrap().saved_sample_rates = HashMap::new();
            return;
        }

        let throughput_per_key = (total_goal / num_keys as f64).max(1.0).trunc();
        let new_rates: HashMap<String, u64> = counts
            .into_iter()
            .map(|(key, count)| (key, (count as f64 / throughput_per_key).max(1.0) as u64))
            .collect();

        state.lock().unwrap().saved_sample_rates = new_rates;
    }
}

impl Sampler for TotalThroughput {
    fn start(&self) -> Result<()> {
        let clear_frequency = self.config.clear_frequency()?;
        let total_goal =
            self.config.goal_throughput_per_sec() as f64 * clear_frequency.as_secs_f64();
        self.state.lock().unwrap().current_counts = HashMap::new();

        let state = Arc::clone(&self.state);
        self.worker.start(clear_frequency, move |_| {
            Self::update_maps(&state, total_goal);
        });
        Ok(())
    }

    fn stop(&self) {
        self.worker.stop();
    }

    fn get_sample_rate_multi(&self, key: &str, count: u64) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.record(key, count, self.config.max_keys);
        state.saved_sample_rates.get(key).copied().unwrap_or(1)
    }

    fn get_metrics(&self, prefix: &str) -> HashMap<String, i64> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let Some(keys) = state.metric_keys.bind(prefix) else {
            return HashMap::new();
        };
        HashMap::from([
            (keys.request_count.clone(), state.request_count),
            (keys.event_count.clone(), state.event_count),
            (keys.keyspace_size.clone(), state.current_counts.len() as i64),
        ])
    }
}
