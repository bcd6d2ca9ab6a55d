// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

/// Common rate calculation for the key-based samplers.
///
/// Each key's goal number of events is its log10 share of the total,
/// scaled by `goal_ratio`, but never less than one. Keys that fall below
/// their goal get a sample rate of 1 and their unused budget is
/// redistributed over the keys still to come.
///
/// Keys are visited in sorted byte order so floating-point rounding does
/// not depend on map iteration order; `goal_ratio` may be non-finite when
/// the caller's traffic contains only unit counts.
pub(crate) fn calculate_sample_rates(
    goal_ratio: f64,
    buckets: &HashMap<String, f64>,
) -> HashMap<String, u64> {
    // A single bucket gets no redistribution; skip the sort.
    if buckets.len() == 1 {
        return buckets
            .iter()
            .map(|(k, &v)| (k.clone(), single_bucket_rate(goal_ratio, v)))
            .collect();
    }

    let mut keys: Vec<&String> = buckets.keys().collect();
    keys.sort_unstable();

    let mut new_sample_rates = HashMap::with_capacity(buckets.len());
    let mut keys_remaining = buckets.len() as f64;
    let mut extra = 0.0_f64;
    for key in keys {
        let count = buckets[key].max(1.0);
        // the max of 1 or this key's log10 share of the total
        let mut goal_for_key = (count.log10() * goal_ratio).max(1.0);
        // take this key's share of the extra and pass the rest along
        let extra_for_key = extra / keys_remaining;
        goal_for_key += extra_for_key;
        extra -= extra_for_key;
        keys_remaining -= 1.0;
        if count <= goal_for_key {
            // fewer samples than the allotted number for this key: sample
            // rate 1 and the unused slots flow to future keys
            new_sample_rates.insert(key.clone(), 1);
            extra += goal_for_key - count;
        } else {
            // more samples than the allotted number: sample this key
            // enough to knock it under the limit (round up)
            let rate = (count / goal_for_key).ceil();
            // counts <= 1 can make goal_for_key +Inf and the division NaN;
            // fall back to 1 in that case
            let rate = if rate.is_finite() { rate.max(1.0) as u64 } else { 1 };
            new_sample_rates.insert(key.clone(), rate);
            extra += goal_for_key - count / rate as f64;
        }
    }
    new_sample_rates
}

fn single_bucket_rate(goal_ratio: f64, count: f64) -> u64 {
    let count = count.max(1.0);
    let goal_for_key = (count.log10() * goal_ratio).max(1.0);
    if count <= goal_for_key {
        return 1;
    }
    let rate = (count / goal_for_key).ceil();
    if rate.is_finite() {
        rate.max(1.0) as u64
    } else {
        1
    }
}
