// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metrics::MetricKeys;
use crate::sampler::Sampler;
use crate::worker::Worker;
use crate::{Error, Result};

const DEFAULT_CLEAR_FREQUENCY: Duration = Duration::from_secs(30);

/// The rate returned for every occurrence of a key after its first.
const REPEAT_RATE: u64 = 1_000_000_000;

/// Configuration for [`OnlyOnce`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnlyOnceConfig {
    /// How often the seen-key set resets, in seconds.
    /// DEPRECATED -- use `clear_frequency`.
    #[serde(default)]
    pub clear_frequency_sec: Option<u64>,

    /// How often the seen-key set resets. Either this or
    /// `clear_frequency_sec` can be specified, but not both. If neither is
    /// set, the default is 30s.
    #[serde(default)]
    pub clear_frequency: Option<Duration>,

    /// When true, the seen-key set never clears and each key is reported
    /// only once for the life of the process. No background work runs.
    #[serde(default)]
    pub once_per_process: bool,
}

impl OnlyOnceConfig {
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
}

/// A sampler that returns a rate of 1 the first time a key is seen and
/// 1,000,000,000 every subsequent time, so every key is reported once per
/// clear window and effectively never again.
///
/// It is not guaranteed that each key is reported exactly once, just that
/// the first event is reported and subsequent events are overwhelmingly
/// unlikely to be. This emulates what you might expect from something
/// catching stack traces: the first one is important, every repeat just
/// restates the same information.
pub struct OnlyOnce {
    config: OnlyOnceConfig,
    state: Arc<Mutex<OnlyOnceState>>,
    worker: Worker,
}

#[derive(Default)]
struct OnlyOnceState {
    seen: HashSet<String>,
    request_count: i64,
    event_count: i64,
    metric_keys: MetricKeys,
}

impl OnlyOnce {
    pub fn new(config: OnlyOnceConfig) -> Self {
        OnlyOnce {
            config,
            state: Arc::new(Mutex::new(OnlyOnceState::default())),
            worker: Worker::new(),
        }
    }
}

impl Sampler for OnlyOnce {
    fn start(&self) -> Result<()> {
        let clear_frequency = self.config.clear_frequency()?;
        self.state.lock().unwrap().seen = HashSet::new();
        if self.config.once_per_process {
            return Ok(());
        }

        let state = Arc::clone(&self.state);
        self.worker.start(clear_frequency, move |_| {
            state.lock().unwrap().seen.clear();
        });
        Ok(())
    }

    fn stop(&self) {
        self.worker.stop();
    }

    fn get_sample_rate_multi(&self, key: &str, count: u64) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.request_count += 1;
        state.event_count += count as i64;

        if state.seen.contains(key) {
            return REPEAT_RATE;
        }
        state.seen.insert(key.to_string());
        1
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
            (keys.keyspace_size.clone(), state.seen.len() as i64),
        ])
    }
}
