//! TenantControlPlane reconciler
//!
//! One reconciliation converges at most one resource: the pipeline is
//! walked in order and the first resource reporting a change has its status
//! persisted, then the tenant is requeued immediately. A pass where every
//! resource is unchanged requeues after the resync interval.

use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::{pipeline, Context};
use crate::crd::{TenantControlPlane, FINALIZER};
use crate::error::{Error, ErrorAction, Result};
use crate::resources::{handle, Outcome};
use crate::store::Objects;
use crate::utilities::{update, update_status};

/// Delay used when the error policy asks for a backoff
const ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// What a single reconciliation did, used for logging and metrics
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pass {
    Absent,
    Finalized,
    FinalizerAdded,
    Changed { resource: &'static str, outcome: Outcome },
    Converged,
}

impl Pass {
    fn label(&self) -> &'static str {
        match self {
            Pass::Absent => "absent",
            Pass::Finalized => "finalized",
            Pass::FinalizerAdded => "finalizer-added",
            Pass::Changed { .. } => "changed",
            Pass::Converged => "converged",
        }
    }
}

fn has_finalizer(tenant: &TenantControlPlane) -> bool {
    tenant.finalizers().iter().any(|f| f == FINALIZER)
}

/// Reconcile a TenantControlPlane
#[instrument(skip(tenant, ctx), fields(tenant = %tenant.key()))]
pub async fn reconcile(tenant: Arc<TenantControlPlane>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = run(&tenant, &ctx).await;

    let outcome = match &result {
        Ok(pass) => pass.label(),
        Err(err) if err.is_sentinel() => "waiting",
        Err(_) => "error",
    };
    ctx.metrics.reconciled("tenant", outcome, started.elapsed());

    match result {
        Ok(Pass::Absent) | Ok(Pass::Finalized) => Ok(Action::await_change()),
        Ok(Pass::FinalizerAdded) | Ok(Pass::Changed { .. }) => Ok(Action::requeue(Duration::ZERO)),
        Ok(Pass::Converged) => Ok(Action::requeue(ctx.config.resync_interval)),
        Err(err) if err.is_sentinel() => {
            debug!(reason = %err, "tenant not ready, requeueing");
            Ok(action_for(err.action()))
        }
        Err(err) => Err(err),
    }
}

async fn run(tenant: &TenantControlPlane, ctx: &Arc<Context>) -> Result<Pass> {
    let name = tenant.name_any();
    let tenants: Objects<TenantControlPlane> = Objects::namespaced(ctx.store.clone(), &tenant.namespace_or_default());

    // The cached copy may predate the last status write
    let Some(tenant) = tenants.get(&name).await? else {
        debug!("tenant is gone");
        return Ok(Pass::Absent);
    };

    if tenant.metadata.deletion_timestamp.is_some() {
        if !has_finalizer(&tenant) {
            return Ok(Pass::Absent);
        }
        finalize(&tenants, &tenant, ctx).await?;
        return Ok(Pass::Finalized);
    }

    if !has_finalizer(&tenant) {
        update(&tenants, &name, |t| {
            if !has_finalizer(t) {
                t.finalizers_mut().push(FINALIZER.to_string());
            }
            Ok(())
        })
        .await?;
        debug!("finalizer added");
        return Ok(Pass::FinalizerAdded);
    }

    for mut resource in pipeline::resources(ctx) {
        let outcome = handle(resource.as_mut(), &tenant).await?;
        if !outcome.changed() {
            continue;
        }

        update_status(&tenants, &name, |t| {
            let mut status = t.status_or_default();
            resource.update_status(&mut status);
            t.status = Some(status);
        })
        .await?;
        ctx.metrics.resource_operation(resource.name(), &outcome.to_string());
        info!(resource = resource.name(), %outcome, "resource reconciled");
        return Ok(Pass::Changed {
            resource: resource.name(),
            outcome,
        });
    }

    debug!("tenant converged");
    Ok(Pass::Converged)
}

/// Release external state, then let the API server delete the tenant
async fn finalize(tenants: &Objects<TenantControlPlane>, tenant: &TenantControlPlane, ctx: &Arc<Context>) -> Result<()> {
    for mut resource in pipeline::deletable(ctx) {
        if resource.delete(tenant).await? {
            info!(resource = resource.name(), "tenant resources released");
            ctx.metrics.resource_operation(resource.name(), "deleted");
        }
    }

    update(tenants, &tenant.name_any(), |t| {
        t.finalizers_mut().retain(|f| f != FINALIZER);
        Ok(())
    })
    .await?;
    info!("finalizer removed");
    Ok(())
}

fn action_for(action: ErrorAction) -> Action {
    match action {
        ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
        ErrorAction::RequeueWithBackoff => Action::requeue(ERROR_BACKOFF),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

/// Error policy for the tenant controller
pub fn error_policy(tenant: Arc<TenantControlPlane>, error: &Error, _ctx: Arc<Context>) -> Action {
    match error.action() {
        ErrorAction::NoRequeue => {
            error!(tenant = %tenant.key(), %error, "reconciliation failed, waiting for a spec change")
        }
        _ => warn!(tenant = %tenant.key(), %error, "reconciliation failed"),
    }
    action_for(error.action())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::tenant_control_plane::tests::tenant;
    use crate::crd::{DataStoreDriver, VersionPhase};
    use crate::pki::certificate_info;
    use crate::resources::certificates::CertificateKind;
    use crate::resources::secret_value;
    use crate::resources::testing::Harness;
    use crate::store::ObjectStore;
    use k8s_openapi::api::batch::v1::Job;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ApiResource;

    const MAX_PASSES: usize = 100;

    fn fixture() -> TenantControlPlane {
        let mut tcp = tenant("team-a", "alpha");
        tcp.metadata.uid = None;
        tcp.spec.network_profile.address = Some("192.0.2.10".into());
        tcp
    }

    /// Reconcile until the tenant stops requesting immediate requeues
    async fn settle(harness: &Harness, tcp: &TenantControlPlane) -> Action {
        for _ in 0..MAX_PASSES {
            let action = reconcile(Arc::new(tcp.clone()), harness.ctx.clone()).await.unwrap();
            if action != Action::requeue(Duration::ZERO) {
                return action;
            }
        }
        panic!("tenant did not settle after {MAX_PASSES} passes");
    }

    fn operations(harness: &Harness, resource: &str, result: &str) -> bool {
        let text = String::from_utf8(harness.ctx.metrics.encode().unwrap()).unwrap();
        text.contains(&format!(
            "hangar_resource_operations_total{{resource=\"{resource}\",result=\"{result}\"}} 1"
        ))
    }

    #[tokio::test]
    async fn test_absent_tenant_is_ignored() {
        let harness = Harness::new();
        let action = reconcile(Arc::new(fixture()), harness.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(harness.store.writes(), 0);
    }

    #[tokio::test]
    async fn test_finalizer_comes_first() {
        let harness = Harness::new();
        harness.datastore("default", DataStoreDriver::Etcd).await;
        let tcp = harness.tenant(fixture()).await;

        let action = reconcile(Arc::new(tcp.clone()), harness.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::ZERO));

        let stored = harness.reload(&tcp).await;
        assert!(has_finalizer(&stored));
        assert!(stored.status.is_none());
    }

    #[tokio::test]
    async fn test_provisions_until_control_plane_is_ready() {
        let harness = Harness::new();
        harness.datastore("default", DataStoreDriver::Etcd).await;
        let tcp = harness.tenant(fixture()).await;

        // The control plane never becomes ready in memory
        assert_eq!(settle(&harness, &tcp).await, Action::requeue(Duration::from_secs(5)));

        let stored = harness.reload(&tcp).await;
        let status = stored.status_or_default();
        assert_eq!(status.storage.data_store_name, "default");
        assert_eq!(status.kubernetes_resources.version.status, Some(VersionPhase::Provisioning));
        assert!(!status.certificates.ca.checksum.is_empty());
        assert!(!status.kubeconfig.scheduler.secret_name.is_empty());
        assert!(!status.kubernetes_resources.deployment.name.is_empty());
        assert!(!status.kubernetes_resources.deployment.ready);

        // Storage setup reported Created exactly once
        assert!(operations(&harness, "datastore-setup", "created"));
        let backend = harness.backends.connection("default").unwrap();
        assert!(backend.backend().users.contains_key(&tcp.datastore_schema()));
    }

    #[tokio::test]
    async fn test_converged_tenant_is_not_written() {
        let harness = Harness::new();
        harness.datastore("default", DataStoreDriver::Etcd).await;
        let tcp = harness.tenant(fixture()).await;
        settle(&harness, &tcp).await;

        let writes = harness.store.writes();
        let journal = harness.backends.connection("default").unwrap().backend().journal.len();
        settle(&harness, &tcp).await;
        assert_eq!(harness.store.writes(), writes);
        assert_eq!(harness.backends.connection("default").unwrap().backend().journal.len(), journal);
    }

    #[tokio::test]
    async fn test_cleared_checksum_regenerates_certificate() {
        let harness = Harness::new();
        harness.datastore("default", DataStoreDriver::Etcd).await;
        let tcp = harness.tenant(fixture()).await;
        settle(&harness, &tcp).await;

        let stored = harness.reload(&tcp).await;
        let secret_name = stored.status_or_default().certificates.api_server.secret_name;
        let secrets: Objects<Secret> = Objects::namespaced(harness.ctx.store.clone(), "team-a");
        let before = secret_value(&secrets.get_required(&secret_name).await.unwrap(), "apiserver.crt").unwrap();

        let tenants: Objects<TenantControlPlane> = Objects::namespaced(harness.ctx.store.clone(), "team-a");
        update_status(&tenants, "alpha", |t| {
            let mut status = t.status_or_default();
            status.certificates.api_server.checksum.clear();
            t.status = Some(status);
        })
        .await
        .unwrap();
        settle(&harness, &tcp).await;

        let after = secret_value(&secrets.get_required(&secret_name).await.unwrap(), "apiserver.crt").unwrap();
        assert_ne!(before, after);
        let (old, new) = (
            certificate_info(before.as_bytes()).unwrap(),
            certificate_info(after.as_bytes()).unwrap(),
        );
        assert_ne!(old.serial, new.serial);
        assert_eq!(old.subject, new.subject);
        assert!(operations(&harness, CertificateKind::ApiServer.resource_name(), "updated"));
    }

    #[tokio::test]
    async fn test_deletion_releases_sql_storage_in_order() {
        let harness = Harness::new();
        harness.datastore("default", DataStoreDriver::MySQL).await;
        let tcp = harness.tenant(fixture()).await;
        settle(&harness, &tcp).await;

        let resource = ApiResource::erase::<TenantControlPlane>(&());
        assert!(harness.ctx.store.delete(&resource, Some("team-a"), "alpha").await.unwrap());
        assert!(harness.store.contains(&resource, Some("team-a"), "alpha"));

        let action = reconcile(Arc::new(tcp.clone()), harness.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(!harness.store.contains(&resource, Some("team-a"), "alpha"));

        let journal = harness.backends.connection("default").unwrap().backend().journal.clone();
        let teardown: Vec<&str> = journal
            .iter()
            .map(String::as_str)
            .skip_while(|op| !op.starts_with("revoke:"))
            .collect();
        let schema = tcp.datastore_schema();
        assert_eq!(
            teardown,
            [
                format!("revoke:{schema}@{schema}"),
                format!("delete_user:{schema}"),
                format!("delete_db:{schema}"),
            ]
        );
    }

    #[tokio::test]
    async fn test_datastore_change_starts_migration() {
        let harness = Harness::new();
        harness.datastore("default", DataStoreDriver::Etcd).await;
        harness.datastore("etcd-2", DataStoreDriver::Etcd).await;
        let tcp = harness.tenant(fixture()).await;
        settle(&harness, &tcp).await;

        let tenants: Objects<TenantControlPlane> = Objects::namespaced(harness.ctx.store.clone(), "team-a");
        update(&tenants, "alpha", |t| {
            t.spec.data_store = Some("etcd-2".into());
            Ok(())
        })
        .await
        .unwrap();

        let action = reconcile(Arc::new(tcp.clone()), harness.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::ZERO));
        let stored = harness.reload(&tcp).await;
        assert_eq!(stored.version_phase(), Some(VersionPhase::Migrating));
        assert_eq!(stored.status_or_default().storage.data_store_name, "default");

        let jobs: Objects<Job> = Objects::namespaced(harness.ctx.store.clone(), &harness.ctx.config.migrate_namespace);
        assert_eq!(jobs.list(None).await.unwrap().len(), 1);

        // The job is still running
        let action = reconcile(Arc::new(tcp.clone()), harness.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
    }

    #[test]
    fn test_error_policy_actions() {
        let harness = Harness::new();
        let tcp = Arc::new(fixture());
        assert_eq!(
            error_policy(tcp.clone(), &Error::InvalidSpec("bad".into()), harness.ctx.clone()),
            Action::await_change()
        );
        assert_eq!(
            error_policy(tcp.clone(), &Error::Internal("boom".into()), harness.ctx.clone()),
            Action::requeue(ERROR_BACKOFF)
        );
        assert_eq!(
            error_policy(tcp, &Error::missing("ca", "not yet"), harness.ctx.clone()),
            Action::requeue(Duration::from_secs(5))
        );
    }
}
