// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub(crate) const REQUEST_COUNT_SUFFIX: &str = "request_count";
pub(crate) const EVENT_COUNT_SUFFIX: &str = "event_count";
pub(crate) const KEYSPACE_SIZE_SUFFIX: &str = "keyspace_size";
pub(crate) const BURST_COUNT_SUFFIX: &str = "burst_count";
pub(crate) const INTERVAL_COUNT_SUFFIX: &str = "interval_count";

/// Metric key names, joined once from the first prefix a caller hands to
/// `get_metrics` and reused on every later call. A later call with a
/// different prefix gets nothing back; the bound names never change.
#[derive(Debug, Default)]
pub(crate) struct MetricKeys {
    bound: Option<BoundKeys>,
}

#[derive(Debug)]
pub(crate) struct BoundKeys {
    prefix: String,
    pub request_count: String,
    pub event_count: String,
    pub keyspace_size: String,
    pub burst_count: String,
    pub interval_count: String,
}

impl BoundKeys {
    fn new(prefix: &str) -> Self {
        BoundKeys {
            prefix: prefix.to_string(),
            request_count: format!("{prefix}{REQUEST_COUNT_SUFFIX}"),
            event_count: format!("{prefix}{EVENT_COUNT_SUFFIX}"),
            keyspace_size: format!("{prefix}{KEYSPACE_SIZE_SUFFIX}"),
            burst_count: format!("{prefix}{BURST_COUNT_SUFFIX}"),
            interval_count: format!("{prefix}{INTERVAL_COUNT_SUFFIX}"),
        }
    }
}

impl MetricKeys {
    /// Binds the prefix on first use and returns the joined key names, or
    /// `None` when the prefix does not match the one already bound.
    pub fn bind(&mut self, prefix: &str) -> Option<&BoundKeys> {
        let bound = self.bound.get_or_insert_with(|| BoundKeys::new(prefix));
        (bound.prefix == prefix).then_some(&*bound)
    }
}
