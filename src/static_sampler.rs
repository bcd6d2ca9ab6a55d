// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::metrics::MetricKeys;
use crate::sampler::Sampler;
use crate::Result;

/// Configuration for [`Static`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticConfig {
    /// The set of sample rates to use, by key.
    #[serde(default)]
    pub rates: HashMap<String, u64>,

    /// The rate to use for keys not present in `rates`. Default 1.
    #[serde(default)]
    pub default: Option<u64>,
}

/// A sampler with a static mapping from key to sample rate. Useful when a
/// known set of keys should be sampled at specific rates, with a default
/// applied to everything else. No background work.
pub struct Static {
    rates: HashMap<String, u64>,
    default: u64,
    state: Mutex<StaticState>,
}

#[derive(Default)]
struct StaticState {
    request_count: i64,
    event_count: i64,
    metric_keys: MetricKeys,
}

impl Static {
    pub fn new(config: StaticConfig) -> Self {
        Static {
            default: config.default.unwrap_or(1),
            rates: config.rates,
            state: Mutex::new(StaticState::default()),
        }
    }
}

impl Sampler for Static {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn get_sample_rate_multi(&self, key: &str, count: u64) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.request_count += 1;
        state.event_count += count as i64;
        drop(state);

        self.rates.get(key).copied().unwrap_or(self.default)
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
            (keys.keyspace_size.clone(), self.rates.len() as i64),
        ])
    }
}
