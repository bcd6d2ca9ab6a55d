// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Machinery shared by the exponential-moving-average samplers: the EMA
//! update itself, burst bookkeeping, and the serialized state snapshot.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::metrics::MetricKeys;
use crate::rate_calculator::calculate_sample_rates;
use crate::Result;

pub(crate) const DEFAULT_WEIGHT: f64 = 0.5;
pub(crate) const DEFAULT_BURST_MULTIPLE: f64 = 2.0;
pub(crate) const DEFAULT_BURST_DETECTION_DELAY: u64 = 3;

#[derive(Default)]
pub(crate) struct EmaState {
    pub saved_sample_rates: HashMap<String, u64>,
    pub current_counts: HashMap<String, f64>,
    pub moving_average: HashMap<String, f64>,
    pub burst_threshold: f64,
    pub current_burst_sum: f64,
    pub interval_count: u64,
    /// Whether at least one recompute (or a state load) has produced
    /// rates; until then a configured fallback rate is returned.
    pub have_data: bool,
    /// Serializes recomputes: a recompute arriving while one is in flight
    /// returns immediately instead of duplicating the work.
    pub updating: bool,
    pub request_count: i64,
    pub event_count: i64,
    pub burst_count: i64,
    pub metric_keys: MetricKeys,
}

/// Burst detection tuning shared by the EMA samplers.
#[derive(Clone, Copy)]
pub(crate) struct BurstParams {
    pub burst_multiple: f64,
    pub burst_detection_delay: u64,
}

impl EmaState {
    /// Advances the counters for one `get_sample_rate_multi` call and
    /// reports whether an out-of-schedule recompute should be requested.
    pub fn record(
        &mut self,
        key: &str,
        count: u64,
        max_keys: Option<usize>,
        burst: &BurstParams,
    ) -> bool {
        self.request_count += 1;
        self.event_count += count as i64;

        let at_capacity = max_keys.is_some_and(|max| self.current_counts.len() >= max);
        if !at_capacity || self.current_counts.contains_key(key) {
            *self.current_counts.entry(key.to_string()).or_insert(0.0) += count as f64;
            self.current_burst_sum += count as f64;
        }

        if self.burst_threshold > 0.0
            && self.current_burst_sum >= self.burst_threshold
            && self.interval_count >= burst.burst_detection_delay
        {
            // reset the sum so further calls don't pile on more burst
            // recomputes while this one runs
            self.current_burst_sum = 0.0;
            self.burst_count += 1;
            return true;
        }
        false
    }

    /// Looks up the rate for a key, falling back to `cold_start_rate`
    /// before the first recompute and to 1 for keys without a stored rate.
    pub fn rate_for(&self, key: &str, cold_start_rate: u64) -> u64 {
        if !self.have_data {
            return cold_start_rate;
        }
        self.saved_sample_rates.get(key).copied().unwrap_or(1)
    }
}

/// The standard EMA update: `alpha * value + (1 - alpha) * old`.
pub(crate) fn adjust_average(old_avg: f64, value: f64, alpha: f64) -> f64 {
    value * alpha + (1.0 - alpha) * old_avg
}

/// Folds one interval's counts into the moving average. Keys absent from
/// the new counts decay toward zero, and keys whose average falls below
/// `age_out_value` are forgotten, which also keeps the map from growing
/// forever.
pub(crate) fn update_ema(
    moving_average: &mut HashMap<String, f64>,
    mut new_counts: HashMap<String, f64>,
    weight: f64,
    age_out_value: f64,
) {
    let existing: Vec<String> = moving_average.keys().cloned().collect();
    for key in existing {
        // keys seen this interval adjust by their count, the rest by zero
        let observed = new_counts.remove(&key).unwrap_or(0.0);
        let new_avg = adjust_average(moving_average[&key], observed, weight);
        if new_avg < age_out_value {
            moving_average.remove(&key);
        } else {
            moving_average.insert(key, new_avg);
        }
    }

    for (key, value) in new_counts {
        let new_avg = adjust_average(0.0, value, weight);
        if new_avg >= age_out_value {
            moving_average.insert(key, new_avg);
        }
    }
}

/// Recompute shared by the EMA samplers: decay the averages with the
/// interval's counts, publish the burst threshold, and rebuild the rate
/// table toward `goal_count(sum_events)` kept events per interval.
///
/// The heavy math runs without the lock, on the counts swapped out of the
/// state and a copy of the moving average; the results are published
/// wholesale. The `updating` flag keeps recomputes single-flight.
pub(crate) fn update_maps(
    state: &Mutex<EmaState>,
    weight: f64,
    age_out_value: f64,
    burst_multiple: f64,
    goal_count: impl Fn(f64) -> f64,
) {
    let (counts, mut moving_average) = {
        let mut locked = state.lock().unwrap();
        // No traffic in the last interval: deliberately leave the average
        // alone so it doesn't decay through outages or bursty schedules.
        if locked.current_counts.is_empty() {
            return;
        }
        if locked.updating {
            return;
        }
        locked.updating = true;
        locked.current_burst_sum = 0.0;
        (
            std::mem::take(&mut locked.current_counts),
            locked.moving_average.clone(),
        )
    };

    update_ema(&mut moving_average, counts, weight, age_out_value);

    // counts scaled by the weight can sit below 1; clamping keeps the
    // log terms from skewing the rates at low throughput
    let sum_events: f64 = moving_average.values().map(|count| count.max(1.0)).sum();

    // checked on the hot path, so publish under the lock
    state.lock().unwrap().burst_threshold = sum_events * burst_multiple;

    let log_sum: f64 = moving_average
        .values()
        .map(|count| count.max(1.0).log10())
        .sum();
    let goal_ratio = goal_count(sum_events) / log_sum;

    let new_rates = calculate_sample_rates(goal_ratio, &moving_average);
    let mut locked = state.lock().unwrap();
    locked.moving_average = moving_average;
    locked.saved_sample_rates = new_rates;
    locked.have_data = true;
    locked.updating = false;
}

/// Serialized form of an EMA sampler's durable state. Future versions may
/// add fields but never remove these.
#[derive(Serialize, Deserialize)]
pub(crate) struct EmaSnapshot {
    pub saved_sample_rates: HashMap<String, u64>,
    pub moving_average: HashMap<String, f64>,
}

pub(crate) fn save_state(state: &Mutex<EmaState>) -> Result<Vec<u8>> {
    let state = state.lock().unwrap();
    let snapshot = EmaSnapshot {
        saved_sample_rates: state.saved_sample_rates.clone(),
        moving_average: state.moving_average.clone(),
    };
    Ok(serde_json::to_vec(&snapshot)?)
}

pub(crate) fn load_state(state: &Mutex<EmaState>, payload: &[u8]) -> Result<()> {
    let snapshot: EmaSnapshot = serde_json::from_slice(payload)?;
    let mut state = state.lock().unwrap();
    state.saved_sample_rates = snapshot.saved_sample_rates;
    state.moving_average = snapshot.moving_average;
    // behave as if we already have data, returning stored rates instead
    // of the startup fallback
    state.have_data = true;
    Ok(())
}

pub(crate) fn metrics(state: &Mutex<EmaState>, prefix: &str) -> HashMap<String, i64> {
    let mut state = state.lock().unwrap();
    let state = &mut *state;
    let Some(keys) = state.metric_keys.bind(prefix) else {
        return HashMap::new();
    };
    HashMap::from([
        (keys.request_count.clone(), state.request_count),
        (keys.event_count.clone(), state.event_count),
        (keys.keyspace_size.clone(), state.current_counts.len() as i64),
        (keys.burst_count.clone(), state.burst_count),
        (keys.interval_count.clone(), state.interval_count as i64),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjust_average() {
        assert_eq!(adjust_average(0.0, 100.0, 0.5), 50.0);
        assert_eq!(adjust_average(100.0, 0.0, 0.5), 50.0);
        assert_eq!(adjust_average(100.0, 100.0, 0.2), 100.0);
    }

    #[test]
    fn test_update_ema_converges_on_observations() {
        let mut average = HashMap::new();
        let cases: &[(f64, f64, f64, f64, f64, f64)] = &[
            // (a value, a expected, b value, b expected, c value, c expected)
            (463.0, 93.0, 235.0, 47.0, 0.0, 0.0),
            (176.0, 109.0, 458.0, 129.0, 0.0, 0.0),
            (345.0, 156.0, 470.0, 197.0, 0.0, 0.0),
            (339.0, 193.0, 317.0, 221.0, 0.0, 0.0),
            (197.0, 194.0, 165.0, 210.0, 0.0, 0.0),
            (387.0, 232.0, 95.0, 187.0, 6960.0, 1392.0),
        ];

        for (a, a_expected, b, b_expected, c, c_expected) in cases {
            let counts = HashMap::from([
                ("a".to_string(), *a),
                ("b".to_string(), *b),
                ("c".to_string(), *c),
            ]);
            update_ema(&mut average, counts, 0.2, 0.2);
            assert_eq!(average.get("a").copied().unwrap_or(0.0).round(), *a_expected);
            assert_eq!(average.get("b").copied().unwrap_or(0.0).round(), *b_expected);
            assert_eq!(average.get("c").copied().unwrap_or(0.0).round(), *c_expected);
        }
    }

    #[test]
    fn test_ema_ages_out_unseen_keys() {
        let state = Mutex::new(EmaState::default());
        for _ in 0..100 {
            state.lock().unwrap().current_counts = HashMap::from([("foo".to_string(), 500.0)]);
            update_maps(&state, 0.2, 0.2, 2.0, |sum| sum / 20.0);
        }
        {
            let locked = state.lock().unwrap();
            assert_eq!(locked.moving_average.len(), 1);
            assert_eq!(locked.moving_average["foo"].round(), 500.0);
        }

        // observe no occurrences of foo for many intervals
        for _ in 0..100 {
            state.lock().unwrap().current_counts = HashMap::from([("asdf".to_string(), 1.0)]);
            update_maps(&state, 0.2, 0.2, 2.0, |sum| sum / 20.0);
        }
        let locked = state.lock().unwrap();
        assert!(!locked.moving_average.contains_key("foo"));
        assert!(locked.moving_average.contains_key("asdf"));
    }

    #[test]
    fn test_no_traffic_leaves_average_alone() {
        let state = Mutex::new(EmaState {
            moving_average: HashMap::from([("k".to_string(), 80.0)]),
            ..Default::default()
        });
        update_maps(&state, 0.5, 0.5, 2.0, |sum| sum / 10.0);
        assert_eq!(state.lock().unwrap().moving_average["k"], 80.0);
    }

    #[test]
    fn test_updating_flag_skips_reentrant_recompute() {
        let state = Mutex::new(EmaState {
            current_counts: HashMap::from([("k".to_string(), 10.0)]),
            updating: true,
            ..Default::default()
        });
        update_maps(&state, 0.5, 0.5, 2.0, |sum| sum / 10.0);
        let locked = state.lock().unwrap();
        // nothing happened: counts intact, no rates produced
        assert_eq!(locked.current_counts["k"], 10.0);
        assert!(locked.saved_sample_rates.is_empty());
        assert!(!locked.have_data);
    }

    #[test]
    fn test_burst_threshold_published() {
        let state = Mutex::new(EmaState {
            current_counts: HashMap::from([("foo".to_string(), 1000.0)]),
            ..Default::default()
        });
        update_maps(&state, 0.5, 0.5, 2.0, |sum| sum / 10.0);
        // 0.5 (weight) * 1000 * 2 (multiple)
        assert_eq!(state.lock().unwrap().burst_threshold, 1000.0);
    }

    #[test]
    fn test_record_tracks_burst_sum_and_fires_after_delay() {
        let burst = BurstParams {
            burst_multiple: 2.0,
            burst_detection_delay: 3,
        };
        let mut state = EmaState {
            burst_threshold: 1000.0,
            ..Default::default()
        };

        for _ in 0..=1000 {
            assert!(!state.record("bar", 1, None, &burst));
        }
        // above the threshold, but not enough intervals have passed yet
        assert_eq!(state.current_burst_sum, 1001.0);

        state.interval_count = 3;
        assert!(state.record("bar", 1, None, &burst));
        assert_eq!(state.current_burst_sum, 0.0);
        assert_eq!(state.burst_count, 1);
    }

    #[test]
    fn test_negative_burst_multiple_disables_detection() {
        let burst = BurstParams {
            burst_multiple: -1.0,
            burst_detection_delay: 0,
        };
        let mut state = EmaState {
            burst_threshold: -2000.0,
            interval_count: 100,
            ..Default::default()
        };
        for _ in 0..5000 {
            assert!(!state.record("k", 1, None, &burst));
        }
    }

    #[test]
    fn test_snapshot_round_trip_preserves_moving_average() {
        let state = Mutex::new(EmaState {
            saved_sample_rates: HashMap::from([("foo".to_string(), 2), ("bar".to_string(), 4)]),
            moving_average: HashMap::from([
                ("foo".to_string(), 500.1234),
                ("bar".to_string(), 9999.99),
            ]),
            have_data: true,
            ..Default::default()
        });

        let payload = save_state(&state).unwrap();

        let restored = Mutex::new(EmaState::default());
        load_state(&restored, &payload).unwrap();
        let locked = restored.lock().unwrap();
        assert!(locked.have_data);
        assert_eq!(locked.saved_sample_rates["foo"], 2);
        assert_eq!(locked.saved_sample_rates["bar"], 4);
        // bit-identical floats survive the round trip
        assert_eq!(locked.moving_average["foo"], 500.1234);
        assert_eq!(locked.moving_average["bar"], 9999.99);
    }
}
