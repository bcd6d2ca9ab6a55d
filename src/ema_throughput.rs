// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::ema::{
    self, BurstParams, EmaState, DEFAULT_BURST_DETECTION_DELAY, DEFAULT_BURST_MULTIPLE,
    DEFAULT_WEIGHT,
};
use crate::sampler::Sampler;
use crate::worker::{Tick, Worker};
use crate::{Error, Result};

const DEFAULT_ADJUSTMENT_INTERVAL: Duration = Duration::from_secs(15);
const MIN_ADJUSTMENT_INTERVAL: Duration = Duration::from_millis(1);
const DEFAULT_INITIAL_SAMPLE_RATE: u64 = 10;
const DEFAULT_GOAL_THROUGHPUT_PER_SEC: u64 = 100;

/// Configuration for [`EmaThroughput`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmaThroughputConfig {
    /// How often the moving average adjusts from recent observations.
    /// Default 15s; must be at least one millisecond.
    #[serde(default)]
    pub adjustment_interval: Option<Duration>,

    /// The weighting factor used to adjust the EMA, between 0 and 1
    /// exclusive (the `alpha` constant in the EMA literature). Larger
    /// values let newer observations influence the average more, making
    /// rates adapt faster; smaller values make them steadier. Default 0.5.
    #[serde(default)]
    pub weight: Option<f64>,

    /// The sample rate used during startup, before enough data has
    /// accumulated to compute one. Useful when unsampled throughput is
    /// high enough to cause problems on its own. Default 10.
    #[serde(default)]
    pub initial_sample_rate: Option<u64>,

    /// The target number of events to send per second. Sample rates are
    /// generated to squash the total throughput down to this goal; actual
    /// throughput may exceed it. Default 100.
    #[serde(default)]
    pub goal_throughput_per_sec: Option<u64>,

    /// Limits the number of distinct keys tracked per interval. Once the
    /// limit is reached, new keys are not counted; existing keys continue
    /// to accumulate. Unbounded when unset.
    #[serde(default)]
    pub max_keys: Option<usize>,

    /// The moving average of an unobserved key approaches zero but never
    /// reaches it; keys whose average falls below this threshold are
    /// forgotten. Defaults to `weight`.
    #[serde(default)]
    pub age_out_value: Option<f64>,

    /// Multiplied by the sum of the moving averages to form the burst
    /// detection threshold: when an interval's observed volume exceeds it,
    /// the average is updated immediately instead of waiting for the next
    /// adjustment. Default 2; negative disables.
    #[serde(default)]
    pub burst_multiple: Option<f64>,

    /// Number of intervals to run after start before burst detection
    /// kicks in. Default 3.
    #[serde(default)]
    pub burst_detection_delay: Option<u64>,
}

impl EmaThroughputConfig {
    fn adjustment_interval(&self) -> Result<Duration> {
        let interval = self.adjustment_interval.unwrap_or(DEFAULT_ADJUSTMENT_INTERVAL);
        if interval < MIN_ADJUSTMENT_INTERVAL {
            return Err(Error::IntervalTooShort(interval));
        }
        Ok(interval)
    }

    fn weight(&self) -> f64 {
        self.weight.unwrap_or(DEFAULT_WEIGHT)
    }

    fn initial_sample_rate(&self) -> u64 {
        self.initial_sample_rate.unwrap_or(DEFAULT_INITIAL_SAMPLE_RATE)
    }

    fn goal_throughput_per_sec(&self) -> u64 {
        self.goal_throughput_per_sec
            .unwrap_or(DEFAULT_GOAL_THROUGHPUT_PER_SEC)
    }

    fn age_out_value(&self) -> f64 {
        self.age_out_value.unwrap_or_else(|| self.weight())
    }

    fn burst_params(&self) -> BurstParams {
        BurstParams {
            burst_multiple: self.burst_multiple.unwrap_or(DEFAULT_BURST_MULTIPLE),
            burst_detection_delay: self
                .burst_detection_delay
                .unwrap_or(DEFAULT_BURST_DETECTION_DELAY),
        }
    }
}

/// A sampler that steers toward a goal number of events per second,
/// weighting rare and frequent traffic differently like
/// [`EmaSampleRate`](crate::EmaSampleRate) but squashing total volume to
/// a throughput target instead of an average rate. During traffic bursts
/// it lowers rates to keep events per second roughly constant.
///
/// Keys absent from the moving average always get a sample rate of 1, so
/// every key is represented at least once in any given window.
pub struct EmaThroughput {
    config: EmaThroughputConfig,
    state: Arc<Mutex<EmaState>>,
    worker: Worker,
}

impl EmaThroughput {
    pub fn new(config: EmaThroughputConfig) -> Self {
        EmaThroughput {
            config,
            state: Arc::new(Mutex::new(EmaState::default())),
            worker: Worker::new(),
        }
    }

    fn update_maps(state: &Mutex<EmaState>, config: &EmaThroughputConfig, interval: Duration) {
        // goal kept events per interval, independent of observed volume
        let goal_count = config.goal_throughput_per_sec() as f64 * interval.as_secs_f64();
        ema::update_maps(
            state,
            config.weight(),
            config.age_out_value(),
            config.burst_params().burst_multiple,
            |_sum_events| goal_count,
        );
    }
}

impl Sampler for EmaThroughput {
    fn start(&self) -> Result<()> {
        let interval = self.config.adjustment_interval()?;
        debug!(
            "starting throughput sampler: goal {}/s adjusted every {:?}",
            self.config.goal_throughput_per_sec(),
            interval
        );
        {
            let mut state = self.state.lock().unwrap();
            state.current_counts = HashMap::new();
            state.current_burst_sum = 0.0;
        }

        let state = Arc::clone(&self.state);
        let config = self.config.clone();
        self.worker.start(interval, move |tick| {
            Self::update_maps(&state, &config, interval);
            if tick == Tick::Interval {
                state.lock().unwrap().interval_count += 1;
            }
        });
        Ok(())
    }

    fn stop(&self) {
        self.worker.stop();
    }

    fn get_sample_rate_multi(&self, key: &str, count: u64) -> u64 {
        let (rate, burst) = {
            let mut state = self.state.lock().unwrap();
            let burst = state.record(key, count, self.config.max_keys, &self.config.burst_params());
            (state.rate_for(key, self.config.initial_sample_rate()), burst)
        };
        if burst {
            debug!("traffic burst detected; requesting early sample rate adjustment");
            self.worker.signal();
        }
        rate
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        ema::save_state(&self.state)
    }

    fn load_state(&self, state: &[u8]) -> Result<()> {
        ema::load_state(&self.state, state)
    }

    fn get_metrics(&self, prefix: &str) -> HashMap<String, i64> {
        ema::metrics(&self.state, prefix)
    }
}
