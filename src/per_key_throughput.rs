// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metrics::MetricKeys;
use crate::sampler::Sampler;
use crate::worker::Worker;
use crate::{Error, Result};

const DEFAULT_CLEAR_FREQUENCY: Duration = Duration::from_secs(30);
const DEFAULT_PER_KEY_THROUGHPUT_PER_SEC: u64 = 10;

/// Configuration for [`PerKeyThroughput`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerKeyThroughputConfig {
    /// How often the counters reset, in seconds.
    /// DEPRECATED -- use `clear_frequency`.
    #[serde(default)]
    pub clear_frequency_sec: Option<u64>,

    /// How often the counters reset. Either this or `clear_frequency_sec`
    /// can be specified, but not both. If neither is set, the default is
    /// 30s.
    #[serde(default)]
    pub clear_frequency: Option<Duration>,

    /// The target number of events to send per second per key. Sample
    /// rates are generated per key to squash its throughput down to this
    /// goal. Default 10.
    #[serde(default)]
    pub per_key_throughput_per_sec: Option<u64>,

    /// Limits the number of distinct keys tracked within one interval.
    /// Once the limit is reached, new keys are not counted; existing keys
    /// continue to accumulate. Unbounded when unset.
    #[serde(default)]
    pub max_keys: Option<usize>,
}

impl PerKeyThroughputConfig {
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

    fn per_key_throughput_per_sec(&self) -> u64 {
        self.per_key_throughput_per_sec
            .unwrap_or(DEFAULT_PER_KEY_THROUGHPUT_PER_SEC)
    }
}

/// A sampler that steers toward a fixed number of events per key per
/// second. Use it when capturing a minimum amount of traffic for every key
/// matters but anything beyond that does not, no matter how many keys
/// there are or how much traffic comes through.
pub struct PerKeyThroughput {
    config: PerKeyThroughputConfig,
    state: Arc<Mutex<ThroughputState>>,
    worker: Worker,
}

#[derive(Default)]
pub(crate) struct ThroughputState {
    pub saved_sample_rates: HashMap<String, u64>,
    pub current_counts: HashMap<String, u64>,
    pub request_count: i64,
    pub event_count: i64,
    pub metric_keys: MetricKeys,
}

impl ThroughputState {
    /// Advances the per-key counter, honoring the key cap: at capacity,
    /// new keys are ignored while existing keys keep counting.
    pub fn record(&mut self, key: &str, count: u64, max_keys: Option<usize>) {
        self.request_count += 1;
        self.event_count += count as i64;

        let at_capacity = max_keys.is_some_and(|max| self.current_counts.len() >= max);
        if !at_capacity || self.current_counts.contains_key(key) {
            *self.current_counts.entry(key.to_string()).or_insert(0) += count;
        }
    }
}

impl PerKeyThroughput {
    pub fn new(config: PerKeyThroughputConfig) -> Self {
        PerKeyThroughput {
            config,
            state: Arc::new(Mutex::new(ThroughputState::default())),
            worker: Worker::new(),
        }
    }

    /// Recomputes the rate table from the counters accumulated over the
    /// interval, then resets the counters.
    fn update_maps(state: &Mutex<ThroughputState>, per_key_goal: f64) {
        let counts = {
            let mut state = state.lock().unwrap();
            std::mem::take(&mut state.current_counts)
        };

        if counts.is_empty() {
            // no traffic during the last interval
            state.lock().unwrap().saved_sample_rates = HashMap::new();
            return;
        }

        let new_rates: HashMap<String, u64> = counts
            .into_iter()
            .map(|(key, count)| (key, (count as f64 / per_key_goal).max(1.0) as u64))
            .collect();

        state.lock().unwrap().saved_sample_rates = new_rates;
    }
}

impl Sampler for PerKeyThroughput {
    fn start(&self) -> Result<()> {
        let clear_frequency = self.config.clear_frequency()?;
        let per_key_goal =
            (self.config.per_key_throughput_per_sec() as f64 * clear_frequency.as_secs_f64()).max(1.0);
        self.state.lock().unwrap().current_counts = HashMap::new();

        let state = Arc::clone(&self.state);
        self.worker.start(clear_frequency, move |_| {
            Self::update_maps(&state, per_key_goal);
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

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(entries: &[(&str, u64)]) -> HashMap<String, u64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_update_maps() {
        // goal of 10 events per key per second over a 30s interval
        let per_key_goal = 300.0;
        let cases: &[(&[(&str, u64)], &[(&str, u64)])] = &[
            (
                &[("one", 1), ("two", 45), ("three", 612), ("four", 10000)],
                &[("one", 1), ("two", 1), ("three", 2), ("four", 33)],
            ),
            (&[("one", 300)], &[("one", 1)]),
            (&[("one", 301)], &[("one", 1)]),
            (&[("one", 900)], &[("one", 3)]),
            (&[], &[]),
        ];

        for (input, expected) in cases {
            let state = Mutex::new(ThroughputState {
                current_counts: counts(input),
                ..Default::default()
            });
            PerKeyThroughput::update_maps(&state, per_key_goal);
            let state = state.lock().unwrap();
            assert!(state.current_counts.is_empty());
            assert_eq!(state.saved_sample_rates, counts(expected));
        }
    }

    #[test]
    fn test_unknown_keys_return_one() {
        let s = PerKeyThroughput::new(PerKeyThroughputConfig::default());
        assert_eq!(s.get_sample_rate("never-computed"), 1);
    }

    #[test]
    fn test_max_keys_caps_new_keys() {
        let s = PerKeyThroughput::new(PerKeyThroughputConfig {
            max_keys: Some(2),
            ..Default::default()
        });
        s.get_sample_rate("one");
        s.get_sample_rate("two");
        s.get_sample_rate("three");
        s.get_sample_rate_multi("one", 4);

        let state = s.state.lock().unwrap();
        assert_eq!(state.current_counts.len(), 2);
        assert_eq!(state.current_counts["one"], 5);
        assert!(!state.current_counts.contains_key("three"));
    }

    #[test]
    fn test_start_rejects_conflicting_frequencies() {
        let s = PerKeyThroughput::new(PerKeyThroughputConfig {
            clear_frequency_sec: Some(10),
            clear_frequency: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        assert!(matches!(s.start(), Err(Error::DeprecatedConfig { .. })));
    }

    #[test]
    fn test_metrics() {
        let s = PerKeyThroughput::new(PerKeyThroughputConfig::default());
        s.get_sample_rate_multi("a", 2);
        s.get_sample_rate_multi("b", 3);

        let metrics = s.get_metrics("pk");
        assert_eq!(metrics["pkrequest_count"], 2);
        assert_eq!(metrics["pkevent_count"], 5);
        assert_eq!(metrics["pkkeyspace_size"], 2);
        assert!(s.get_metrics("other").is_empty());
    }
}
