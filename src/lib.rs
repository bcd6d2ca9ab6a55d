// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dynamic sampling for high-volume telemetry streams.
//!
//! A caller partitions its traffic by a string key (for example HTTP status
//! code + route) and asks a [`Sampler`] for an integer sample rate for each
//! event or batch of events. The caller keeps the event with probability
//! `1/rate` and, if kept, tags it with the rate so downstream consumers can
//! reconstruct population statistics. The samplers in this crate differ in
//! how they steer those rates: toward a goal average sample rate, toward a
//! goal throughput, per key or in total, over fixed or rolling windows,
//! with or without an exponential moving average of past traffic.
//!
//! All samplers share a lifecycle: configure, [`Sampler::start`], call
//! [`Sampler::get_sample_rate`] from any number of threads, optionally
//! persist state across restarts with [`Sampler::save_state`] /
//! [`Sampler::load_state`], then [`Sampler::stop`].

pub(crate) mod avg_sample_rate;
pub(crate) mod avg_sample_with_min;
pub(crate) mod block_list;
pub(crate) mod ema;
pub(crate) mod ema_sample_rate;
pub(crate) mod ema_throughput;
pub(crate) mod error;
pub(crate) mod metrics;
pub(crate) mod only_once;
pub(crate) mod per_key_throughput;
pub(crate) mod rate_calculator;
pub(crate) mod sampler;
pub(crate) mod static_sampler;
pub(crate) mod total_throughput;
pub(crate) mod windowed_throughput;
pub(crate) mod worker;

pub use avg_sample_rate::{AvgSampleRate, AvgSampleRateConfig};
pub use avg_sample_with_min::{AvgSampleWithMin, AvgSampleWithMinConfig};
pub use ema_sample_rate::{EmaSampleRate, EmaSampleRateConfig};
pub use ema_throughput::{EmaThroughput, EmaThroughputConfig};
pub use error::{Error, Result};
pub use only_once::{OnlyOnce, OnlyOnceConfig};
pub use per_key_throughput::{PerKeyThroughput, PerKeyThroughputConfig};
pub use sampler::Sampler;
pub use static_sampler::{Static, StaticConfig};
pub use total_throughput::{TotalThroughput, TotalThroughputConfig};
pub use windowed_throughput::{WindowedThroughput, WindowedThroughputConfig};
