// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metrics::MetricKeys;
use crate::rate_calculator::calculate_sample_rates;
use crate::sampler::Sampler;
use crate::worker::Worker;
use crate::{Error, Result};

const DEFAULT_CLEAR_FREQUENCY: Duration = Duration::from_secs(30);
const DEFAULT_GOAL_SAMPLE_RATE: u64 = 10;

/// Configuration for [`AvgSampleRate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvgSampleRateConfig {
    /// How often the counters reset, in seconds.
    /// DEPRECATED -- use `clear_frequency`.
    #[serde(default)]
    pub clear_frequency_sec: Option<u64>,

    /// How often the counters reset. Either this or `clear_frequency_sec`
    /// can be specified, but not both. If neither is set, the default is
    /// 30s.
    #[serde(default)]
    pub clear_frequency: Option<Duration>,

    /// The average sample rate to aim for across all events. Default 10.
    #[serde(default)]
    pub goal_sample_rate: Option<u64>,

    /// Limits the number of distinct keys tracked within one interval.
    /// Once the limit is reached, new keys are not counted; existing keys
    /// continue to accumulate. Unbounded when unset.
    #[serde(default)]
    pub max_keys: Option<usize>,
}

impl AvgSampleRateConfig {
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

    fn goal_sample_rate(&self) -> u64 {
        self.goal_sample_rate.unwrap_or(DEFAULT_GOAL_SAMPLE_RATE)
    }
}

/// A sampler that aims for a goal average sample rate across all events,
/// weighting rare and frequent traffic differently so the average comes
/// out right.
///
/// Keys seen only once per interval always get a rate of 1; more frequent
/// keys are sampled on a logarithmic curve, so every key is represented at
/// least once per interval while frequent keys carry most of the
/// reduction. The method breaks down when total traffic is very low,
/// because it then samples excessively.
pub struct AvgSampleRate {
    config: AvgSampleRateConfig,
    state: Arc<Mutex<AvgState>>,
    worker: Worker,
}

#[derive(Default)]
pub(crate) struct AvgState {
    pub saved_sample_rates: HashMap<String, u64>,
    pub current_counts: HashMap<String, f64>,
    /// Whether at least one recompute (or a state load) has produced
    /// rates. Until then the goal rate itself is the safer answer, so a
    /// cold start does not flood the downstream consumer at rate 1.
    pub have_data: bool,
    pub request_count: i64,
    pub event_count: i64,
    pub metric_keys: MetricKeys,
}

impl AvgState {
    pub fn record(&mut self, key: &str, count: u64, max_keys: Option<usize>) {
        self.request_count += 1;
        self.event_count += count as i64;

        let at_capacity = max_keys.is_some_and(|max| self.current_counts.len() >= max);
        if !at_capacity || self.current_counts.contains_key(key) {
            *self.current_counts.entry(key.to_string()).or_insert(0.0) += count as f64;
        }
    }
}

/// Serialized form of the sampler's durable state.
#[derive(Serialize, Deserialize)]
struct AvgSampleRateSnapshot {
    saved_sample_rates: HashMap<String, u64>,
}

impl AvgSampleRate {
    pub fn new(config: AvgSampleRateConfig) -> Self {
        AvgSampleRate {
            config,
            state: Arc::new(Mutex::new(AvgState::default())),
            worker: Worker::new(),
        }
    }

    /// Recomputes the rate table from the interval's counters: the goal
    /// number of kept events is the received total over the goal rate, and
    /// each key's share of it is proportional to the log10 of its count.
    fn update_maps(state: &Mutex<AvgState>, goal_sample_rate: u64) {
        let counts = {
            let mut state = state.lock().unwrap();
            std::mem::take(&mut state.current_counts)
        };

        if counts.is_empty() {
            // no traffic during the last interval
            state.lock().unwrap().saved_sample_rates = HashMap::new();
            return;
        }

        let sum_events: f64 = counts.values().sum();
        let goal_count = sum_events / goal_sample_rate as f64;
        let log_sum: f64 = counts.values().map(|count| count.log10()).sum();
        // can be non-finite when every count is 1; the calculator falls
        // back to a rate of 1 for those keys
        let goal_ratio = goal_count / log_sum;

        let new_rates = calculate_sample_rates(goal_ratio, &counts);
        let mut state = state.lock().unwrap();
        state.saved_sample_rates = new_rates;
        state.have_data = true;
    }
}

impl Sampler for AvgSampleRate {
    fn start(&self) -> Result<()> {
        let clear_frequency = self.config.clear_frequency()?;
        let goal_sample_rate = self.config.goal_sample_rate();
        // saved rates survive (they may come from a state load); the
        // current window starts fresh
        self.state.lock().unwrap().current_counts = HashMap::new();

        let state = Arc::clone(&self.state);
        self.worker.start(clear_frequency, move |_| {
            Self::update_maps(&state, goal_sample_rate);
        });
        Ok(())
    }

    fn stop(&self) {
        self.worker.stop();
    }

    fn get_sample_rate_multi(&self, key: &str, count: u64) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.record(key, count, self.config.max_keys);

        if !state.have_data {
            return self.config.goal_sample_rate();
        }
        state.saved_sample_rates.get(key).copied().unwrap_or(1)
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let snapshot = AvgSampleRateSnapshot {
            saved_sample_rates: state.saved_sample_rates.clone(),
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    fn load_state(&self, state: &[u8]) -> Result<()> {
        let snapshot: AvgSampleRateSnapshot = serde_json::from_slice(state)?;
        let mut state = self.state.lock().unwrap();
        state.saved_sample_rates = snapshot.saved_sample_rates;
        // behave as if we already have data, returning stored rates
        // instead of the startup fallback
        state.have_data = true;
        Ok(())
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
    use crate::Sampler;

    fn float_counts(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn rates(entries: &[(&str, u64)]) -> HashMap<String, u64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_update_maps() {
        let cases: &[(&[(&str, f64)], &[(&str, u64)])] = &[
            (
                &[
                    ("one", 1.0),
                    ("two", 1.0),
                    ("three", 2.0),
                    ("four", 5.0),
                    ("five", 8.0),
                    ("six", 15.0),
                    ("seven", 45.0),
                    ("eight", 612.0),
                    ("nine", 2000.0),
                    ("ten", 10000.0),
                ],
                &[
                    ("one", 1),
                    ("two", 1),
                    ("three", 1),
                    ("four", 1),
                    ("five", 1),
                    ("six", 1),
                    ("seven", 1),
                    ("eight", 6),
                    ("nine", 14),
                    ("ten", 47),
                ],
            ),
            (
                &[
                    ("one", 1.0),
                    ("two", 1.0),
                    ("three", 2.0),
                    ("four", 5.0),
                    ("five", 8.0),
                    ("six", 15.0),
                    ("seven", 45.0),
                    ("eight", 50.0),
                    ("nine", 60.0),
                ],
                &[
                    ("one", 1),
                    ("two", 1),
                    ("three", 2),
                    ("four", 5),
                    ("five", 8),
                    ("six", 11),
                    ("seven", 24),
                    ("eight", 26),
                    ("nine", 30),
                ],
            ),
            (
                &[
                    ("one", 1.0),
                    ("two", 1.0),
                    ("three", 2.0),
                    ("four", 5.0),
                    ("five", 7.0),
                ],
                &[("one", 1), ("two", 1), ("three", 2), ("four", 5), ("five", 7)],
            ),
            (
                &[
                    ("one", 1000.0),
                    ("two", 1000.0),
                    ("three", 2000.0),
                    ("four", 5000.0),
                    ("five", 7000.0),
                ],
                &[("one", 7), ("two", 7), ("three", 13), ("four", 29), ("five", 39)],
            ),
            (
                &[
                    ("one", 6000.0),
                    ("two", 6000.0),
                    ("three", 6000.0),
                    ("four", 6000.0),
                    ("five", 6000.0),
                ],
                &[("one", 20), ("two", 20), ("three", 20), ("four", 20), ("five", 20)],
            ),
            (&[("one", 12000.0)], &[("one", 20)]),
            (&[], &[]),
        ];

        for (i, (input, expected)) in cases.iter().enumerate() {
            let state = Mutex::new(AvgState {
                current_counts: float_counts(input),
                ..Default::default()
            });
            AvgSampleRate::update_maps(&state, 20);
            let state = state.lock().unwrap();
            assert!(state.current_counts.is_empty());
            assert_eq!(state.saved_sample_rates, rates(expected), "case {i} failed");
        }
    }

    #[test]
    fn test_startup_returns_goal_rate() {
        let s = AvgSampleRate::new(AvgSampleRateConfig {
            goal_sample_rate: Some(10),
            ..Default::default()
        });
        assert_eq!(s.get_sample_rate("key"), 10);
        // the counters still get bumped
        assert_eq!(s.state.lock().unwrap().current_counts["key"], 1.0);
    }

    #[test]
    fn test_known_and_unknown_keys_after_data() {
        let s = AvgSampleRate::new(AvgSampleRateConfig::default());
        {
            let mut state = s.state.lock().unwrap();
            state.saved_sample_rates = rates(&[("one", 10), ("two", 1), ("three", 5)]);
            state.have_data = true;
        }
        assert_eq!(s.get_sample_rate("one"), 10);
        assert_eq!(s.get_sample_rate("two"), 1);
        assert_eq!(s.get_sample_rate("unknown"), 1);
    }

    #[test]
    fn test_save_and_load_state() {
        let s = AvgSampleRate::new(AvgSampleRateConfig::default());
        {
            let mut state = s.state.lock().unwrap();
            state.saved_sample_rates = rates(&[("foo", 2), ("bar", 4)]);
            state.have_data = true;
        }

        let payload = s.save_state().unwrap();

        let restored = AvgSampleRate::new(AvgSampleRateConfig::default());
        restored.load_state(&payload).unwrap();
        restored.start().unwrap();
        assert_eq!(restored.get_sample_rate("foo"), 2);
        assert_eq!(restored.get_sample_rate("bar"), 4);
        restored.stop();
    }

    #[test]
    fn test_load_state_rejects_garbage() {
        let s = AvgSampleRate::new(AvgSampleRateConfig::default());
        assert!(matches!(
            s.load_state(b"not json at all"),
            Err(Error::Deserialization(_))
        ));
    }

    #[test]
    fn test_state_payload_shape() {
        let s = AvgSampleRate::new(AvgSampleRateConfig::default());
        s.state.lock().unwrap().saved_sample_rates = rates(&[("k", 3)]);
        let payload = s.save_state().unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["saved_sample_rates"]["k"], 3);
    }

    #[test]
    fn test_rates_never_zero_under_concurrent_updates() {
        let s = Arc::new(AvgSampleRate::new(AvgSampleRateConfig {
            goal_sample_rate: Some(2),
            ..Default::default()
        }));
        s.state.lock().unwrap().have_data = true;

        std::thread::scope(|scope| {
            for reader in 0..8 {
                let s = Arc::clone(&s);
                scope.spawn(move || {
                    for _ in 0..1000 {
                        let rate = s.get_sample_rate(&format!("key{reader}"));
                        assert!(rate >= 1, "rate should never be below one");
                    }
                });
            }
            scope.spawn(|| {
                for _ in 0..100 {
                    AvgSampleRate::update_maps(&s.state, 2);
                }
            });
        });
    }
}
