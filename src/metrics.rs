//! Operator metrics
//!
//! All collectors live in one [`prometheus::Registry`] owned by [`Metrics`].
//! `main` creates it, the metrics server encodes it and the controllers
//! receive it through their context.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::time::Duration;

use crate::error::{Error, Result};

pub struct Metrics {
    registry: Registry,
    /// Reconciliations by controller and outcome
    reconciliations: IntCounterVec,
    /// Reconciliation latency
    reconcile_duration: Histogram,
    /// Resource operations by resource and result
    resource_operations: IntCounterVec,
    /// Rotations requested by the certificate lifecycle controller
    certificate_rotations: IntCounter,
    /// Datastore setup/teardown calls by driver and operation
    datastore_operations: IntCounterVec,
}

fn register<C: prometheus::core::Collector + Clone + 'static>(registry: &Registry, collector: C) -> Result<C> {
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| Error::Internal(format!("registering metric: {e}")))?;
    Ok(collector)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help), labels).map_err(|e| Error::Internal(format!("metric {name}: {e}")))
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("hangar".to_string()), None)
            .map_err(|e| Error::Internal(format!("creating registry: {e}")))?;

        let reconciliations = register(
            &registry,
            counter_vec("reconciliations_total", "Reconciliations by controller and outcome", &["controller", "outcome"])?,
        )?;
        let reconcile_duration = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new("reconcile_duration_seconds", "Duration of tenant reconciliations")
                    .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
            )
            .map_err(|e| Error::Internal(format!("metric reconcile_duration_seconds: {e}")))?,
        )?;
        let resource_operations = register(
            &registry,
            counter_vec("resource_operations_total", "Resource operations by resource and result", &["resource", "result"])?,
        )?;
        let certificate_rotations = register(
            &registry,
            IntCounter::new("certificate_rotations_total", "Rotations requested for expiring certificates")
                .map_err(|e| Error::Internal(format!("metric certificate_rotations_total: {e}")))?,
        )?;
        let datastore_operations = register(
            &registry,
            counter_vec("datastore_operations_total", "Datastore operations by driver and operation", &["driver", "operation"])?,
        )?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_duration,
            resource_operations,
            certificate_rotations,
            datastore_operations,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn reconciled(&self, controller: &str, outcome: &str, elapsed: Duration) {
        self.reconciliations.with_label_values(&[controller, outcome]).inc();
        if controller == "tenant" {
            self.reconcile_duration.observe(elapsed.as_secs_f64());
        }
    }

    pub fn resource_operation(&self, resource: &str, result: &str) {
        self.resource_operations.with_label_values(&[resource, result]).inc();
    }

    pub fn rotation_triggered(&self) {
        self.certificate_rotations.inc();
    }

    pub fn datastore_operation(&self, driver: &str, operation: &str) {
        self.datastore_operations.with_label_values(&[driver, operation]).inc();
    }

    /// Text exposition of every collector
    pub fn encode(&self) -> Result<Vec<u8>> {
        use prometheus::{Encoder, TextEncoder};
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("encoding metrics: {e}")))?;
        Ok(buffer)
    }
}
