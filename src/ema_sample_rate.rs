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
const DEFAULT_GOAL_SAMPLE_RATE: u64 = 10;

/// Configuration for [`EmaSampleRate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmaSampleRateConfig {
    /// How often the moving average adjusts from recent observations, in
    /// seconds. DEPRECATED -- use `adjustment_interval`.
    #[serde(default)]
    pub adjustment_interval_sec: Option<u64>,

    /// How often the moving average adjusts from recent observations.
    /// Either this or `adjustment_interval_sec` can be specified, but not
    /// both. If neither is set, the default is 15s.
    #[serde(default)]
    pub adjustment_interval: Option<Duration>,

    /// The weighting factor used to adjust the EMA, between 0 and 1
    /// exclusive (the `alpha` constant in the EMA literature). Larger
    /// values let newer observations influence the average more, making
    /// rates adapt faster; smaller values make them steadier. Default 0.5.
    #[serde(default)]
    pub weight: Option<f64>,

    /// The average sample rate to aim for across all events. Default 10.
    #[serde(default)]
    pub goal_sample_rate: Option<u64>,

    /// Limits the number of distinct keys tracked per interval. Once the
    /// limit is reached, new keys are not counted; existing keys continue
    /// to accumulate. Unbounded when unset.
    #[serde(default)]
    pub max_keys: Option<usize>,

    /// The moving average of an unobserved key approaches zero but never
    /// reaches it; keys whose average falls below this threshold are
    /// forgotten. Defaults to `weight`, which keeps a key with the
    /// smallest count (1) from aging out immediately. Values above
    /// `weight` are rarely what you want.
    #[serde(default)]
    pub age_out_value: Option<f64>,

    /// Multiplied by the sum of the moving averages to form the burst
    /// detection threshold: when an interval's observed volume exceeds it,
    /// the average is updated immediately instead of waiting for the next
    /// adjustment. Default 2 (burst detection kicks in when traffic
    /// doubles); negative disables.
    #[serde(default)]
    pub burst_multiple: Option<f64>,

    /// Number of intervals to run after start before burst detection
    /// kicks in. Default 3.
    #[serde(default)]
    pub burst_detection_delay: Option<u64>,
}

impl EmaSampleRateConfig {
    fn adjustment_interval(&self) -> Result<Duration> {
        match (self.adjustment_interval, self.adjustment_interval_sec) {
            (Some(_), Some(_)) => Err(Error::DeprecatedConfig {
                field: "adjustment_interval_sec",
                replacement: "adjustment_interval",
            }),
            (Some(duration), None) => Ok(duration),
            (None, Some(secs)) => Ok(Duration::from_secs(secs)),
            (None, None) => Ok(DEFAULT_ADJUSTMENT_INTERVAL),
        }
    }

    fn weight(&self) -> f64 {
        self.weight.unwrap_or(DEFAULT_WEIGHT)
    }

    fn goal_sample_rate(&self) -> u64 {
        self.goal_sample_rate.unwrap_or(DEFAULT_GOAL_SAMPLE_RATE)
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

/// A sampler that aims for a goal average sample rate like
/// [`AvgSampleRate`](crate::AvgSampleRate), but drives the calculation
/// from an exponential moving average of per-key counts instead of a
/// fresh counter every interval, so rates ride out noise between
/// intervals. Sudden traffic growth past the burst threshold triggers an
/// immediate adjustment rather than waiting for the next interval.
///
/// Keys absent from the moving average always get a sample rate of 1, so
/// every key is represented at least once in any given window.
pub struct EmaSampleRate {
    config: EmaSampleRateConfig,
    state: Arc<Mutex<EmaState>>,
    worker: Worker,
}

impl EmaSampleRate {
    pub fn new(config: EmaSampleRateConfig) -> Self {
        EmaSampleRate {
            config,
            state: Arc::new(Mutex::new(EmaState::default())),
            worker: Worker::new(),
        }
    }

    fn update_maps(state: &Mutex<EmaState>, config: &EmaSampleRateConfig) {
        let goal_sample_rate = config.goal_sample_rate() as f64;
        ema::update_maps(
            state,
            config.weight(),
            config.age_out_value(),
            config.burst_params().burst_multiple,
            // goal kept events per interval: observed volume over the
            // goal rate
            |sum_events| sum_events / goal_sample_rate,
        );
    }
}

impl Sampler for EmaSampleRate {
    fn start(&self) -> Result<()> {
        let interval = self.config.adjustment_interval()?;
        // saved rates and the moving average survive (they may come from
        // a state load); the current window starts fresh
        {
            let mut state = self.state.lock().unwrap();
            state.current_counts = HashMap::new();
            state.current_burst_sum = 0.0;
        }

        let state = Arc::clone(&self.state);
        let config = self.config.clone();
        self.worker.start(interval, move |tick| {
            Self::update_maps(&state, &config);
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
            (state.rate_for(key, self.config.goal_sample_rate()), burst)
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
