// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use crate::Result;

/// The common capability of every sampler variant in this crate.
///
/// Instantiate one of the concrete samplers with its config struct,
/// depending on the sampling method you'd like to use, and use it through
/// this trait (directly or as a `Box<dyn Sampler>`).
pub trait Sampler: Send + Sync {
    /// Initializes the sampler: validates configuration and spawns the
    /// background recompute worker where the variant has one. Call before
    /// requesting sample rates.
    fn start(&self) -> Result<()>;

    /// Halts the sampler and waits for its background worker to exit.
    /// Calling it again after it has returned is a no-op.
    fn stop(&self);

    /// Returns the sample rate to use for the given key, for a single
    /// event. Equivalent to `get_sample_rate_multi(key, 1)`.
    fn get_sample_rate(&self, key: &str) -> u64 {
        self.get_sample_rate_multi(key, 1)
    }

    /// Returns the sample rate to use for the given key, on behalf of
    /// `count` events. The per-key and per-sampler counters are advanced
    /// by `count` before the rate is looked up.
    fn get_sample_rate_multi(&self, key: &str, count: u64) -> u64;

    /// Returns an opaque byte payload with the sampler's durable state,
    /// suitable for persisting across process restarts. Samplers without
    /// durable state return an empty payload.
    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Restores state produced by [`Sampler::save_state`] on a previous
    /// instance. Call before [`Sampler::start`]. Samplers without durable
    /// state accept and ignore any payload.
    fn load_state(&self, state: &[u8]) -> Result<()> {
        let _ = state;
        Ok(())
    }

    /// Returns the sampler's self-metrics, all values as `i64`. Counter
    /// names end with `_count` and are cumulative; gauges are
    /// instantaneous. Names are the given prefix joined directly to the
    /// metric suffix. The first call pins the prefix; later calls with a
    /// different prefix return an empty map.
    fn get_metrics(&self, prefix: &str) -> HashMap<String, i64>;
}
