// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::avg_sample_rate::AvgState;
use crate::rate_calculator::calculate_sample_rates;
use crate::sampler::Sampler;
use crate::worker::Worker;
use crate::{Error, Result};

const DEFAULT_CLEAR_FREQUENCY: Duration = Duration::from_secs(30);
const DEFAULT_GOAL_SAMPLE_RATE: u64 = 10;
const DEFAULT_MIN_EVENTS_PER_SEC: u64 = 50;

/// Configuration for [`AvgSampleWithMin`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvgSampleWithMinConfig {
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

    /// When the total event rate drops below this threshold, sampling
    /// ceases and everything is kept. Default 50 events per second.
    #[serde(default)]
    pub min_events_per_sec: Option<u64>,

    /// Limits the number of distinct keys tracked within one interval.
    /// Once the limit is reached, new keys are not counted; existing keys
    /// continue to accumulate. Unbounded when unset.
    #[serde(default)]
    pub max_keys: Option<usize>,
}

impl AvgSampleWithMinConfig {
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

    fn min_events_per_sec(&self) -> u64 {
        self.min_events_per_sec.unwrap_or(DEFAULT_MIN_EVENTS_PER_SEC)
    }
}

/// [`AvgSampleRate`](crate::AvgSampleRate) with a floor: when the total
/// volume of an interval falls below a minimum number of events per
/// second, sampling is disabled for the next interval and every key gets a
/// rate of 1. This keeps low-traffic periods fully observed, avoiding the
/// plain average-rate method's weakness at the low end.
pub struct AvgSampleWithMin {
    config: AvgSampleWithMinConfig,
    state: Arc<Mutex<AvgState>>,
    worker: Worker,
}

impl AvgSampleWithMin {
    pub fn new(config: AvgSampleWithMinConfig) -> Self {
        AvgSampleWithMin {
            config,
            state: Arc::new(Mutex::new(AvgState::default())),
            worker: Worker::new(),
        }
    }

    fn update_maps(state: &Mutex<AvgState>, goal_sample_rate: u64, min_events_per_interval: f64) {
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

        // below the minimum volume everything is kept
        if sum_events < min_events_per_interval {
            let new_rates = counts.keys().map(|key| (key.clone(), 1)).collect();
            state.lock().unwrap().saved_sample_rates = new_rates;
            return;
        }

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

impl Sampler for AvgSampleWithMin {
    fn start(&self) -> Result<()> {
        let clear_frequency = self.config.clear_frequency()?;
        let goal_sample_rate = self.config.goal_sample_rate();
        let min_events_per_interval =
            self.config.min_events_per_sec() as f64 * clear_frequency.as_secs_f64();
        self.state.lock().unwrap().current_counts = HashMap::new();

        let state = Arc::clone(&self.state);
        self.worker.start(clear_frequency, move |_| {
            Self::update_maps(&state, goal_sample_rate, min_events_per_interval);
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
