// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::block_list::{BlockList, BoundedBlockList, UnboundedBlockList};
use crate::metrics::MetricKeys;
use crate::sampler::Sampler;
use crate::worker::Worker;
use crate::Result;

const DEFAULT_UPDATE_FREQUENCY: Duration = Duration::from_secs(1);
const DEFAULT_LOOKBACK_MULTIPLE: u32 = 30;
const DEFAULT_GOAL_THROUGHPUT_PER_SEC: f64 = 100.0;

/// Configuration for [`WindowedThroughput`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowedThroughputConfig {
    /// How often the sampling rate is recomputed. Default 1s.
    #[serde(default)]
    pub update_frequency: Option<Duration>,

    /// How far back in time to look when recomputing the sampling rate.
    /// Enforced to be an integer multiple of `update_frequency` (floored).
    /// Default 30 × `update_frequency`.
    #[serde(default)]
    pub lookback_frequency: Option<Duration>,

    /// Target throughput per second. Default 100.
    #[serde(default)]
    pub goal_throughput_per_sec: Option<f64>,

    /// Limits the number of distinct keys tracked within the lookback
    /// window. Once the limit is reached, requests for new keys return a
    /// rate of 0 while existing keys continue to be counted. Unbounded
    /// when unset.
    #[serde(default)]
    pub max_keys: Option<usize>,
}

impl WindowedThroughputConfig {
    fn update_frequency(&self) -> Duration {
        self.update_frequency.unwrap_or(DEFAULT_UPDATE_FREQUENCY)
    }

    fn lookback_frequency(&self) -> Duration {
        let update = self.update_frequency();
        let lookback = self
            .lookback_frequency
            .unwrap_or(update * DEFAULT_LOOKBACK_MULTIPLE);
        // floor to an integer multiple of the update cadence
        let multiple = (lookback.as_nanos() / update.as_nanos()) as u32;
        update * multiple
    }

    fn goal_throughput_per_sec(&self) -> f64 {
        self.goal_throughput_per_sec
            .unwrap_or(DEFAULT_GOAL_THROUGHPUT_PER_SEC)
    }
}

/// Turns timestamps into bucket indexes; essentially a clock quantizer.
pub(crate) trait IndexGenerator: Send + Sync {
    /// The index corresponding to the current time.
    fn current_index(&self) -> i64;

    /// The index differential covering `duration`, i.e. how many ticks of
    /// the index it spans.
    fn duration_to_indexes(&self, duration: Duration) -> i64;
}

/// The standard index generator: one index tick per update interval,
/// anchored to the Unix epoch.
struct UnixIndexGenerator {
    duration_per_index: Duration,
}

impl IndexGenerator for UnixIndexGenerator {
    fn current_index(&self) -> i64 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos();
        (nanos / self.duration_per_index.as_nanos()) as i64
    }

    fn duration_to_indexes(&self, duration: Duration) -> i64 {
        (duration.as_nanos() / self.duration_per_index.as_nanos()) as i64
    }
}

/// An enhanced version of [`TotalThroughput`](crate::TotalThroughput)
/// sampling over a rolling window.
///
/// The plain throughput sampler recomputes every clear interval, which
/// forces a tradeoff: shorten the interval to react to spikes faster and
/// each decision is made on less data, lengthen it and decisions are
/// steadier but stale. This sampler separates the two knobs: rates are
/// recomputed every `update_frequency` from the counts accumulated over
/// the last `lookback_frequency`. A standard configuration recomputes
/// every second over the last 30 seconds of traffic.
///
/// A rate of 0 means the sampler has nothing to go on (no rate computed
/// yet for the key, or the key was rejected by the keyspace cap); callers
/// decide whether to keep or drop those events per their own policy.
pub struct WindowedThroughput {
    config: WindowedThroughputConfig,
    state: Arc<Mutex<WindowedState>>,
    count_list: Arc<dyn BlockList>,
    index_generator: Arc<dyn IndexGenerator>,
    worker: Worker,
}

#[derive(Default)]
struct WindowedState {
    saved_sample_rates: HashMap<String, u64>,
    goal_throughput_per_sec: f64,
    request_count: i64,
    event_count: i64,
    /// Distinct keys seen by the last aggregation.
    num_keys: usize,
    metric_keys: MetricKeys,
}

impl WindowedThroughput {
    pub fn new(config: WindowedThroughputConfig) -> Self {
        let count_list: Arc<dyn BlockList> = match config.max_keys {
            Some(max_keys) => Arc::new(BoundedBlockList::new(max_keys)),
            None => Arc::new(UnboundedBlockList::new()),
        };
        let index_generator = Arc::new(UnixIndexGenerator {
            duration_per_index: config.update_frequency(),
        });
        let state = WindowedState {
            goal_throughput_per_sec: config.goal_throughput_per_sec(),
            ..Default::default()
        };
        WindowedThroughput {
            config,
            state: Arc::new(Mutex::new(state)),
            count_list,
            index_generator,
            worker: Worker::new(),
        }
    }

    /// Adjusts the goal throughput at runtime. Non-positive and non-finite
    /// values are ignored.
    pub fn set_goal_throughput_per_sec(&self, goal: f64) {
        if goal.is_finite() && goal > 0.0 {
            self.state.lock().unwrap().goal_throughput_per_sec = goal;
        }
    }

    /// Recomputes the rate table from the lookback window.
    fn update_maps(
        state: &Mutex<WindowedState>,
        count_list: &dyn BlockList,
        index_generator: &dyn IndexGenerator,
        lookback_indexes: i64,
        lookback_seconds: f64,
    ) {
        let current_index = index_generator.current_index();
        let counts = count_list.aggregate_counts(current_index, lookback_indexes);

        let num_keys = counts.len();
        if num_keys == 0 {
            // no traffic during the lookback window
            let mut state = state.lock().unwrap();
            state.num_keys = 0;
            state.saved_sample_rates = HashMap::new();
            return;
        }

        let goal = state.lock().unwrap().goal_throughput_per_sec;
        // target throughput per key over the lookback window, floored to
        // one event per key per window
        let total_goal_throughput = goal * lookback_seconds;
        let throughput_per_key = (total_goal_throughput / num_keys as f64).max(1.0);
        let new_rates: HashMap<String, u64> = counts
            .into_iter()
            .map(|(key, count)| (key, (count as f64 / throughput_per_key).max(1.0) as u64))
            .collect();

        let mut state = state.lock().unwrap();
        state.num_keys = num_keys;
        state.saved_sample_rates = new_rates;
    }
}

impl Sampler for WindowedThroughput {
    fn start(&self) -> Result<()> {
        let update_frequency = self.config.update_frequency();
        let lookback_frequency = self.config.lookback_frequency();
        let lookback_indexes = self.index_generator.duration_to_indexes(lookback_frequency);
        debug!(
            "starting windowed throughput sampler: update every {:?}, lookback {:?}",
            update_frequency, lookback_frequency
        );

        let state = Arc::clone(&self.state);
        let count_list = Arc::clone(&self.count_list);
        let index_generator = Arc::clone(&self.index_generator);
        let lookback_seconds = lookback_frequency.as_secs_f64();
        self.worker.start(update_frequency, move |_| {
            Self::update_maps(
                &state,
                count_list.as_ref(),
                index_generator.as_ref(),
                lookback_indexes,
                lookback_seconds,
            );
        });
        Ok(())
    }

    fn stop(&self) {
        self.worker.stop();
    }

    fn get_sample_rate_multi(&self, key: &str, count: u64) -> u64 {
        let current_index = self.index_generator.current_index();
        let admitted = self
            .count_list
            .increment_key(key, current_index, count)
            .is_ok();

        let mut state = self.state.lock().unwrap();
        state.request_count += 1;
        state.event_count += count as i64;

        // the keyspace cap rejected the key
        if !admitted {
            return 0;
        }
        // 0 also means "no rate computed yet for this key"
        state.saved_sample_rates.get(key).copied().unwrap_or(0)
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
            (keys.keyspace_size.clone(), state.num_keys as i64),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestIndexGenerator {
        current: Mutex<i64>,
    }

    impl TestIndexGenerator {
        fn advance(&self) {
            *self.current.lock().unwrap() += 1;
        }
    }

    impl IndexGenerator for TestIndexGenerator {
        fn current_index(&self) -> i64 {
            *self.current.lock().unwrap()
        }

        fn duration_to_indexes(&self, duration: Duration) -> i64 {
            duration.as_secs() as i64
        }
    }

    /// A sampler driven by a manual clock, no worker.
    fn manual_sampler(goal: f64, lookback_secs: i64) -> (WindowedThroughput, Arc<TestIndexGenerator>) {
        let clock = Arc::new(TestIndexGenerator {
            current: Mutex::new(0),
        });
        let state = WindowedState {
            goal_throughput_per_sec: goal,
            ..Default::default()
        };
        let sampler = WindowedThroughput {
            config: WindowedThroughputConfig {
                lookback_frequency: Some(Duration::from_secs(lookback_secs as u64)),
                ..Default::default()
            },
            state: Arc::new(Mutex::new(state)),
            count_list: Arc::new(UnboundedBlockList::new()),
            index_generator: Arc::clone(&clock) as Arc<dyn IndexGenerator>,
            worker: Worker::new(),
        };
        (sampler, clock)
    }

    fn recompute(s: &WindowedThroughput, lookback_indexes: i64, lookback_seconds: f64) {
        WindowedThroughput::update_maps(
            &s.state,
            s.count_list.as_ref(),
            s.index_generator.as_ref(),
            lookback_indexes,
            lookback_seconds,
        );
    }

    #[test]
    fn test_happy_path() {
        let (s, clock) = manual_sampler(2.0, 5);

        // time 0: 20 traces seen, no rate computed yet
        for _ in 0..20 {
            assert_eq!(s.get_sample_rate("test_key"), 0);
        }
        clock.advance();
        recompute(&s, 5, 5.0);

        // time 1: 10 traces seen
        for _ in 0..10 {
            assert_eq!(s.get_sample_rate("test_key"), 2);
        }
        clock.advance();
        recompute(&s, 5, 5.0);

        // time 2: 50 traces seen
        for _ in 0..50 {
            assert_eq!(s.get_sample_rate("test_key"), 3);
        }
        clock.advance();
        recompute(&s, 5, 5.0);

        // times 3, 4, 5: nothing
        for _ in 0..3 {
            clock.advance();
            recompute(&s, 5, 5.0);
        }

        // time 6: looks back over (0, 5], where time 0 has rolled off
        for _ in 0..40 {
            assert_eq!(s.get_sample_rate("test_key"), 6);
        }
        clock.advance();
        recompute(&s, 5, 5.0);

        // time 7: looks back over (1, 6]
        for _ in 0..5 {
            assert_eq!(s.get_sample_rate("test_key"), 9);
        }
    }

    #[test]
    fn test_old_blocks_roll_off_entirely() {
        let (s, clock) = manual_sampler(2.0, 5);

        for _ in 0..20 {
            assert_eq!(s.get_sample_rate("test_key"), 0);
        }
        for _ in 0..7 {
            clock.advance();
            recompute(&s, 5, 5.0);
        }
        // everything expired; back to the no-data rate
        assert_eq!(s.get_sample_rate("test_key"), 0);
    }

    #[test]
    fn test_multi_counts_weigh_into_rates() {
        let (s, clock) = manual_sampler(2.0, 5);
        assert_eq!(s.get_sample_rate_multi("test_key", 40), 0);
        clock.advance();
        recompute(&s, 5, 5.0);
        // 40 events against a goal of 2/s over 5s
        assert_eq!(s.get_sample_rate("test_key"), 4);
    }

    #[test]
    fn test_bounded_keyspace_rejects_with_zero() {
        let clock = Arc::new(TestIndexGenerator {
            current: Mutex::new(0),
        });
        let sampler = WindowedThroughput {
            config: WindowedThroughputConfig {
                max_keys: Some(2),
                ..Default::default()
            },
            state: Arc::new(Mutex::new(WindowedState {
                goal_throughput_per_sec: 100.0,
                ..Default::default()
            })),
            count_list: Arc::new(BoundedBlockList::new(2)),
            index_generator: clock,
            worker: Worker::new(),
        };

        assert_eq!(sampler.get_sample_rate("a"), 0);
        assert_eq!(sampler.get_sample_rate("b"), 0);
        // keyspace full: new key rejected, existing keys still accepted
        assert_eq!(sampler.get_sample_rate("c"), 0);
        let metrics_before = sampler.state.lock().unwrap().request_count;
        assert_eq!(metrics_before, 3);
        assert_eq!(sampler.get_sample_rate("a"), 0);
    }

    #[test]
    fn test_defaults_and_lookback_flooring() {
        let config = WindowedThroughputConfig::default();
        assert_eq!(config.update_frequency(), Duration::from_secs(1));
        assert_eq!(config.lookback_frequency(), Duration::from_secs(30));

        let config = WindowedThroughputConfig {
            update_frequency: Some(Duration::from_secs(5)),
            lookback_frequency: Some(Duration::from_secs(18)),
            ..Default::default()
        };
        assert_eq!(config.lookback_frequency(), Duration::from_secs(15));
    }

    #[test]
    fn test_set_goal_throughput() {
        let (s, _clock) = manual_sampler(100.0, 5);
        s.set_goal_throughput_per_sec(200.5);
        assert_eq!(s.state.lock().unwrap().goal_throughput_per_sec, 200.5);

        // invalid values are ignored
        s.set_goal_throughput_per_sec(0.0);
        s.set_goal_throughput_per_sec(-10.5);
        s.set_goal_throughput_per_sec(f64::NAN);
        assert_eq!(s.state.lock().unwrap().goal_throughput_per_sec, 200.5);
    }

    #[test]
    fn test_concurrent_requests() {
        let s = Arc::new(WindowedThroughput::new(WindowedThroughputConfig {
            lookback_frequency: Some(Duration::from_secs(5)),
            max_keys: Some(1000),
            ..Default::default()
        }));
        s.start().unwrap();

        std::thread::scope(|scope| {
            for worker in 0..10 {
                let s = Arc::clone(&s);
                scope.spawn(move || {
                    for i in 0..100 {
                        let key = format!("test-key-{worker}-{}", i % 10);
                        let _rate = s.get_sample_rate_multi(&key, (i % 5) + 1);
                    }
                });
            }
        });
        s.stop();

        let metrics = s.get_metrics("test");
        assert_eq!(metrics["testrequest_count"], 1000);
        assert!(metrics["testevent_count"] > 0);
    }
}
