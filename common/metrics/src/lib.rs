// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-crate metrics registration: each crate builds one
//! `OpMetrics::new_and_registered("name")` via `lazy_static!` and pulls
//! counters/gauges/histograms off it by name, so call sites never touch
//! `prometheus::Registry` directly.

use chain_failure_ext::{ChainErrorKind, Result};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, Encoder, HistogramVec, IntCounterVec, IntGaugeVec,
    Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::Mutex;

/// A namespaced handle onto the global Prometheus registry. Metrics
/// within one `OpMetrics` share a `op=<crate>` label so dashboards can
/// filter by subsystem.
pub struct OpMetrics {
    op: String,
    registry: Registry,
    counters: Mutex<HashMap<String, IntCounterVec>>,
    gauges: Mutex<HashMap<String, IntGaugeVec>>,
    histograms: Mutex<HashMap<String, HistogramVec>>,
}

impl OpMetrics {
    pub fn new_and_registered(op: &str) -> Self {
        OpMetrics {
            op: op.to_string(),
            registry: global_registry(),
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
        }
    }

    fn full_name(&self, name: &str) -> String {
        format!("{}_{}", self.op, name)
    }

    /// Returns (creating on first use) a counter vector labeled by `labels`.
    pub fn counter(&self, name: &str, labels: &[&str]) -> IntCounterVec {
        let mut map = self.counters.lock().expect("metrics mutex poisoned");
        map.entry(name.to_string())
            .or_insert_with(|| {
                register_int_counter_vec_with_registry!(
                    self.full_name(name),
                    format!("{} counter", name),
                    labels,
                    self.registry
                )
                .expect("metric names within a crate must not collide")
            })
            .clone()
    }

    pub fn gauge(&self, name: &str, labels: &[&str]) -> IntGaugeVec {
        let mut map = self.gauges.lock().expect("metrics mutex poisoned");
        map.entry(name.to_string())
            .or_insert_with(|| {
                register_int_gauge_vec_with_registry!(
                    self.full_name(name),
                    format!("{} gauge", name),
                    labels,
                    self.registry
                )
                .expect("metric names within a crate must not collide")
            })
            .clone()
    }

    pub fn histogram(&self, name: &str, labels: &[&str]) -> HistogramVec {
        let mut map = self.histograms.lock().expect("metrics mutex poisoned");
        map.entry(name.to_string())
            .or_insert_with(|| {
                register_histogram_vec_with_registry!(
                    self.full_name(name),
                    format!("{} histogram", name),
                    labels,
                    self.registry
                )
                .expect("metric names within a crate must not collide")
            })
            .clone()
    }

    pub fn inc(&self, name: &str, labels: &[&str]) {
        self.counter(name, labels).with_label_values(labels).inc();
    }

    pub fn set(&self, name: &str, labels: &[&str], value: i64) {
        self.gauge(name, labels).with_label_values(labels).set(value);
    }

    pub fn observe(&self, name: &str, labels: &[&str], value: f64) {
        self.histogram(name, labels)
            .with_label_values(labels)
            .observe(value);
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_REGISTRY: Registry = Registry::new();
}

fn global_registry() -> Registry {
    GLOBAL_REGISTRY.clone()
}

/// Renders every metric registered so far in the Prometheus text exposition
/// format, for the `/metrics` HTTP endpoint wired up in `chain-node`.
pub fn encode_text() -> Result<String> {
    let metric_families = global_registry().gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ChainErrorKind::internal(format!("failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| ChainErrorKind::internal(format!("metrics output was not utf8: {}", e)))
}
