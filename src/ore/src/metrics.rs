// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Metrics for the operator and the agent.
//!
//! The idea here is that each subsystem keeps its metrics in a scoped-to-it struct, which gets
//! registered (once) to the server's (or a test's) prometheus registry.
//!
//! Instead of using prometheus's (very verbose) metrics definitions, we rely on type inference to
//! reduce the verbosity a little bit. A typical subsystem will look like the following:
//!
//! ```rust
//! # use rds_ore::metrics::{MetricsRegistry, UIntGauge};
//! # use rds_ore::metric;
//! #[derive(Debug, Clone)] // Note that prometheus metrics can safely be cloned
//! struct Metrics {
//!     pub managed_clusters: UIntGauge,
//! }
//!
//! impl Metrics {
//!     pub fn register_into(registry: &MetricsRegistry) -> Metrics {
//!         Metrics {
//!             managed_clusters: registry.register(metric!(
//!                 name: "rds_operator_managed_clusters",
//!                 help: "number of clusters currently managed",
//!             )),
//!         }
//!     }
//! }
//! ```

use prometheus::core::{
    Atomic, AtomicI64, AtomicU64, Collector, GenericCounter, GenericCounterVec, GenericGauge,
    GenericGaugeVec, Opts,
};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Registry, TextEncoder};

pub use prometheus::Opts as PrometheusOpts;

/// Define a metric for use in the operator or the agent.
#[macro_export]
macro_rules! metric {
    (
        name: $name:expr,
        help: $help:expr
        $(, var_labels: [ $($vl_name:expr),* ])?
        $(,)?
    ) => {{
        let var_labels: ::std::vec::Vec<String> = vec![
            $(
                $($vl_name.into(),)*
            )?];
        $crate::metrics::PrometheusOpts::new($name, $help)
            .variable_labels(var_labels)
    }}
}

/// An unsigned integer gauge.
pub type UIntGauge = GenericGauge<AtomicU64>;
/// A signed integer gauge.
pub type IntGauge = GenericGauge<AtomicI64>;
/// An unsigned integer counter.
pub type UIntCounter = GenericCounter<AtomicU64>;
/// A vector of unsigned integer counters.
pub type UIntCounterVec = GenericCounterVec<AtomicU64>;
/// A vector of signed integer gauges.
pub type IntGaugeVec = GenericGaugeVec<AtomicI64>;

/// The metrics registry shared by a process.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    inner: Registry,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Creates a new metrics registry.
    pub fn new() -> Self {
        MetricsRegistry {
            inner: Registry::new(),
        }
    }

    /// Registers a metric with the inner registry. The metric must have been
    /// created with the [`metric!`](crate::metric) macro.
    ///
    /// Panics if a metric with the same name was already registered, which
    /// is a programming error.
    pub fn register<M>(&self, opts: Opts) -> M
    where
        M: MakeCollector,
    {
        let collector = M::make_collector(opts);
        self.inner
            .register(Box::new(collector.clone()))
            .expect("metric names are unique within a registry");
        collector
    }

    /// Gathers a list of metric families for export.
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.inner.gather()
    }

    /// Renders all registered metrics in the prometheus text exposition
    /// format.
    pub fn render(&self) -> Result<String, anyhow::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// A wrapper for creating prometheus metrics more conveniently.
///
/// Together with the [`metric!`](crate::metric) macro, this trait is mainly
/// used by [`MetricsRegistry`] and should not normally be used outside the
/// metric registration flow.
pub trait MakeCollector: Collector + Clone + 'static {
    /// Creates a new collector.
    fn make_collector(opts: Opts) -> Self;
}

impl<T> MakeCollector for GenericCounter<T>
where
    T: Atomic + 'static,
{
    fn make_collector(opts: Opts) -> Self {
        Self::with_opts(opts).expect("defining a counter")
    }
}

impl<T> MakeCollector for GenericCounterVec<T>
where
    T: Atomic + 'static,
{
    fn make_collector(opts: Opts) -> Self {
        let labels: Vec<String> = opts.variable_labels.clone();
        let label_refs: Vec<&str> = labels.iter().map(String::as_str).collect();
        Self::new(opts, label_refs.as_slice()).expect("defining a counter vec")
    }
}

impl<T> MakeCollector for GenericGauge<T>
where
    T: Atomic + 'static,
{
    fn make_collector(opts: Opts) -> Self {
        Self::with_opts(opts).expect("defining a gauge")
    }
}

impl<T> MakeCollector for GenericGaugeVec<T>
where
    T: Atomic + 'static,
{
    fn make_collector(opts: Opts) -> Self {
        let labels = opts.variable_labels.clone();
        let labels = &labels.iter().map(|x| x.as_str()).collect::<Vec<_>>();
        Self::new(opts, labels).expect("defining a gauge vec")
    }
}
