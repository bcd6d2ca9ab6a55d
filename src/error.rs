// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by sampler configuration, state persistence and the
/// bounded keyspace. The rate-returning hot path never fails; a capacity
/// rejection manifests there as a sample rate of 0.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Both the deprecated integer-seconds field and its `Duration`
    /// replacement were set on the same configuration.
    #[error("the {field} configuration value is deprecated; use only {replacement}")]
    DeprecatedConfig {
        field: &'static str,
        replacement: &'static str,
    },

    /// The adjustment interval is too short to produce meaningful rates.
    #[error("the adjustment interval {0:?} is unreasonably short for a throughput sampler")]
    IntervalTooShort(Duration),

    /// A persisted state payload did not parse as this sampler's schema.
    #[error("failed to deserialize sampler state: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// The bounded keyspace is full and cannot admit a new key.
    #[error("max keyspace size reached, new key {key:?} rejected")]
    MaxKeysExceeded { key: String },
}
