//! DataStore controller
//!
//! Records which tenants are bound to each DataStore and whether the
//! backend answers a health check. When a DataStore spec changes (new
//! endpoints, rotated credentials) every bound tenant is re-queued so its
//! datastore config and setup are converged again.

use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use super::TriggerSender;
use crate::crd::{DataStore, DataStoreStatus, TenantControlPlane};
use crate::datastore::ConnectionFactory;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::store::{ObjectStoreRef, Objects};
use crate::utilities::update_status;

pub struct DatastoreContext {
    pub store: ObjectStoreRef,
    pub connections: Arc<dyn ConnectionFactory>,
    pub triggers: TriggerSender,
    pub metrics: Arc<Metrics>,
}

/// Connect and run the driver's health check
async fn health_check(ctx: &DatastoreContext, datastore: &DataStore) -> Result<()> {
    let connection = ctx.connections.connect(datastore).await?;
    let result = connection.check().await;
    ctx.metrics.datastore_operation(
        &connection.driver().to_string(),
        if result.is_ok() { "check" } else { "check-failed" },
    );
    result
}

/// `namespace/name` of every tenant bound to `datastore`, sorted
async fn bound_tenants(store: &ObjectStoreRef, datastore: &str) -> Result<Vec<TenantControlPlane>> {
    let tenants: Objects<TenantControlPlane> = Objects::all(store.clone());
    let mut bound: Vec<TenantControlPlane> = tenants
        .list(None)
        .await?
        .into_iter()
        .filter(|t| t.bound_datastore().as_deref() == Some(datastore))
        .collect();
    bound.sort_by_key(|t| t.key());
    Ok(bound)
}

#[instrument(skip(datastore, ctx), fields(datastore = %datastore.name_any()))]
pub async fn reconcile(datastore: Arc<DataStore>, ctx: Arc<DatastoreContext>) -> Result<Action> {
    let started = Instant::now();
    let name = datastore.name_any();
    let tenants = bound_tenants(&ctx.store, &name).await?;

    let status = datastore.status.clone().unwrap_or_default();
    let generation = datastore.metadata.generation;
    if status.observed_generation.is_some() && status.observed_generation != generation {
        for tenant in &tenants {
            let trigger = ObjectRef::<TenantControlPlane>::new(&tenant.name_any()).within(&tenant.namespace_or_default());
            ctx.triggers
                .send(trigger)
                .await
                .map_err(|_| Error::Internal("tenant controller is no longer receiving triggers".into()))?;
        }
        info!(tenants = tenants.len(), "DataStore changed, bound tenants re-queued");
    }

    let health = health_check(&ctx, &datastore).await;
    if let Err(error) = &health {
        warn!(%error, "DataStore health check failed");
    }

    let observed = DataStoreStatus {
        used_by: tenants.iter().map(|t| t.key()).collect(),
        observed_generation: generation,
        ready: health.is_ok(),
        message: health.err().map(|e| e.to_string()),
    };
    let datastores: Objects<DataStore> = Objects::all(ctx.store.clone());
    let written = update_status(&datastores, &name, |d| d.status = Some(observed.clone())).await?;
    if written {
        debug!(used_by = ?observed.used_by, "DataStore status updated");
    }

    ctx.metrics
        .reconciled("datastore", if written { "updated" } else { "unchanged" }, started.elapsed());
    // Bindings change through tenant reconciliations, not DataStore events
    Ok(Action::requeue(Duration::from_secs(60)))
}

pub fn error_policy(datastore: Arc<DataStore>, error: &Error, _ctx: Arc<DatastoreContext>) -> Action {
    warn!(datastore = %datastore.name_any(), %error, "DataStore reconciliation failed");
    Action::requeue(Duration::from_secs(30))
}
