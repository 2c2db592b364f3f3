//! Datastore migration orchestrator
//!
//! When a tenant asks for a DataStore other than the one holding its data,
//! a Job running the `migrate` subcommand copies the data over. While the
//! job runs the pipeline stops here; once it completes the datastore
//! configuration resource rebinds the tenant. The job is removed when the
//! tenant is bound to the desired DataStore again, when the desired
//! DataStore changes under it, and when the tenant is deleted.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{DeletableResource, Resource};
use crate::config::{format_duration, parse_duration};
use crate::controllers::Context;
use crate::crd::{
    TenantControlPlane, TenantControlPlaneStatus, VersionPhase, MIGRATION_SOURCE_ANNOTATION,
    MIGRATION_TARGET_ANNOTATION, MIGRATION_TIMEOUT_ANNOTATION, TENANT_LABEL,
};
use crate::error::{Error, Result};
use crate::store::Objects;
use crate::utilities::OperationResult;

/// Observed state of a migration job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Complete,
    Failed,
}

pub fn job_state(job: &Job) -> JobState {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    let holds = |kind: &str| conditions.iter().any(|c| c.type_ == kind && c.status == "True");
    if holds("Complete") {
        JobState::Complete
    } else if holds("Failed") {
        JobState::Failed
    } else {
        JobState::Running
    }
}

/// Name of the migration job of a tenant
pub fn job_name(tenant: &TenantControlPlane) -> String {
    format!("migrate-{}-{}", tenant.namespace_or_default(), tenant.name_any())
}

/// `(source, target)` a job was created for
pub fn job_route(job: &Job) -> (Option<&str>, Option<&str>) {
    let annotations = job.annotations();
    (
        annotations.get(MIGRATION_SOURCE_ANNOTATION).map(String::as_str),
        annotations.get(MIGRATION_TARGET_ANNOTATION).map(String::as_str),
    )
}

/// Timeout of the migration, from the tenant annotation or the default
pub fn migration_timeout(tenant: &TenantControlPlane, default: Duration) -> Result<Duration> {
    match tenant.annotations().get(MIGRATION_TIMEOUT_ANNOTATION) {
        Some(raw) => parse_duration(raw),
        None => Ok(default),
    }
}

pub struct DatastoreMigrate {
    ctx: Arc<Context>,
    job_name: String,
    source: Option<String>,
    target: String,
    phase: Option<VersionPhase>,
}

impl DatastoreMigrate {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            job_name: String::new(),
            source: None,
            target: String::new(),
            phase: None,
        }
    }

    fn jobs(&self) -> Objects<Job> {
        Objects::namespaced(self.ctx.store.clone(), &self.ctx.config.migrate_namespace)
    }

    fn job(&self, tenant: &TenantControlPlane, timeout: Duration) -> Job {
        let config = &self.ctx.config;
        let mut labels = BTreeMap::from([(TENANT_LABEL.to_string(), tenant.name_any())]);
        labels.insert("app.kubernetes.io/component".to_string(), "migrate".to_string());
        let annotations = BTreeMap::from([
            (MIGRATION_SOURCE_ANNOTATION.to_string(), self.source.clone().unwrap_or_default()),
            (MIGRATION_TARGET_ANNOTATION.to_string(), self.target.clone()),
        ]);

        Job {
            metadata: ObjectMeta {
                name: Some(self.job_name.clone()),
                namespace: Some(config.migrate_namespace.clone()),
                labels: Some(labels.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(1),
                active_deadline_seconds: Some(i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX).max(1)),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(config.migrate_service_account.clone()),
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "migrate".to_string(),
                            image: Some(config.migrate_image.clone()),
                            args: Some(vec![
                                "migrate".to_string(),
                                format!("--tenant-namespace={}", tenant.namespace_or_default()),
                                format!("--tenant-name={}", tenant.name_any()),
                                format!("--target-datastore={}", self.target),
                                format!("--timeout={}", format_duration(timeout)),
                            ]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}

#[async_trait]
impl Resource for DatastoreMigrate {
    fn name(&self) -> &'static str {
        "datastore-migrate"
    }

    async fn define(&mut self, tenant: &TenantControlPlane) -> Result<()> {
        self.job_name = job_name(tenant);
        self.source = tenant.bound_datastore();
        self.target = tenant.desired_datastore(&self.ctx.config.default_datastore);
        Ok(())
    }

    fn should_cleanup(&self, _tenant: &TenantControlPlane) -> bool {
        self.source.as_ref().map_or(true, |source| *source == self.target)
    }

    async fn clean_up(&mut self, tenant: &TenantControlPlane) -> Result<bool> {
        let deleted = self.jobs().delete(&self.job_name).await?;
        if deleted {
            info!(tenant = %tenant.key(), job = %self.job_name, "migration job removed");
        }
        Ok(deleted)
    }

    async fn create_or_update(&mut self, tenant: &TenantControlPlane) -> Result<OperationResult> {
        let jobs = self.jobs();
        let source = self.source.clone().unwrap_or_default();

        match jobs.get(&self.job_name).await? {
            None => {
                let timeout = migration_timeout(tenant, self.ctx.config.migrate_timeout)?;
                jobs.create(&self.job(tenant, timeout)).await?;
                info!(
                    tenant = %tenant.key(),
                    from = %source,
                    to = %self.target,
                    job = %self.job_name,
                    "datastore migration started"
                );
                self.phase = Some(VersionPhase::Migrating);
                Ok(OperationResult::Created)
            }
            // Stale job from an earlier desired DataStore: drop it, the next
            // pass starts the migration to the current one
            Some(job) if job_route(&job) != (Some(source.as_str()), Some(self.target.as_str())) => {
                let (from, to) = job_route(&job);
                jobs.delete(&self.job_name).await?;
                info!(
                    tenant = %tenant.key(),
                    job = %self.job_name,
                    stale_from = from.unwrap_or_default(),
                    stale_to = to.unwrap_or_default(),
                    to = %self.target,
                    "migration job targets another datastore, replacing it"
                );
                self.phase = Some(VersionPhase::Migrating);
                Ok(OperationResult::Updated)
            }
            Some(job) => match job_state(&job) {
                JobState::Running => Err(Error::MigrationInProgress { tenant: tenant.key() }),
                JobState::Failed => {
                    warn!(tenant = %tenant.key(), job = %self.job_name, "datastore migration failed");
                    Err(Error::MigrationFailed {
                        tenant: tenant.key(),
                        reason: format!("job {} failed migrating from {source} to {}", self.job_name, self.target),
                    })
                }
                JobState::Complete => {
                    if tenant.version_phase() == Some(VersionPhase::Migrating) {
                        self.phase = Some(VersionPhase::NotReady);
                    }
                    Ok(OperationResult::None)
                }
            },
        }
    }

    fn should_status_be_updated(&self, tenant: &TenantControlPlane) -> bool {
        self.phase.is_some() && self.phase != tenant.version_phase()
    }

    fn update_status(&self, status: &mut TenantControlPlaneStatus) {
        if let Some(phase) = self.phase {
            status.kubernetes_resources.version.status = Some(phase);
        }
    }
}

#[async_trait]
impl DeletableResource for DatastoreMigrate {
    async fn delete(&mut self, tenant: &TenantControlPlane) -> Result<bool> {
        self.job_name = job_name(tenant);
        let deleted = self.jobs().delete(&self.job_name).await?;
        if deleted {
            info!(tenant = %tenant.key(), job = %self.job_name, "migration job stopped");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::tenant_control_plane::tests::tenant;
    use crate::resources::testing::{apply_status, Harness};
    use crate::resources::{handle, Outcome};
    use assert_matches::assert_matches;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use kube::api::ApiResource;

    fn bound(from: &str, to: &str) -> TenantControlPlane {
        let mut tcp = tenant("team-a", "alpha");
        tcp.spec.data_store = Some(to.to_string());
        let mut status = tcp.status_or_default();
        status.storage.data_store_name = from.to_string();
        status.kubernetes_resources.version.status = Some(VersionPhase::Ready);
        tcp.status = Some(status);
        tcp
    }

    async fn finish(harness: &Harness, condition: &str) {
        let mut job = Objects::<Job>::namespaced(harness.ctx.store.clone(), "hangar-system")
            .get_required("migrate-team-a-alpha")
            .await
            .unwrap();
        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: condition.to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        harness
            .store
            .seed(&ApiResource::erase::<Job>(&()), Some("hangar-system"), &job);
    }

    #[tokio::test]
    async fn test_migration_lifecycle() {
        let harness = Harness::new();
        let mut tcp = bound("old", "new");

        let mut resource = DatastoreMigrate::new(harness.ctx.clone());
        assert_eq!(
            handle(&mut resource, &tcp).await.unwrap(),
            Outcome::Applied(OperationResult::Created)
        );
        apply_status(&resource, &mut tcp);
        assert_eq!(tcp.version_phase(), Some(VersionPhase::Migrating));

        let job = Objects::<Job>::namespaced(harness.ctx.store.clone(), "hangar-system")
            .get_required("migrate-team-a-alpha")
            .await
            .unwrap();
        assert_eq!(job_route(&job), (Some("old"), Some("new")));
        let args = job.spec.unwrap().template.spec.unwrap().containers[0].args.clone().unwrap();
        assert!(args.contains(&"--target-datastore=new".to_string()));
        assert!(args.contains(&"--timeout=5m".to_string()));

        let mut resource = DatastoreMigrate::new(harness.ctx.clone());
        let err = handle(&mut resource, &tcp).await.unwrap_err();
        assert!(err.is_sentinel());

        finish(&harness, "Complete").await;
        let mut resource = DatastoreMigrate::new(harness.ctx.clone());
        assert_eq!(handle(&mut resource, &tcp).await.unwrap(), Outcome::StatusOnly);
        apply_status(&resource, &mut tcp);
        assert_eq!(tcp.version_phase(), Some(VersionPhase::NotReady));

        let mut resource = DatastoreMigrate::new(harness.ctx.clone());
        assert_eq!(handle(&mut resource, &tcp).await.unwrap(), Outcome::Unchanged);

        let mut status = tcp.status_or_default();
        status.storage.data_store_name = "new".into();
        tcp.status = Some(status);
        let mut resource = DatastoreMigrate::new(harness.ctx.clone());
        assert_eq!(handle(&mut resource, &tcp).await.unwrap(), Outcome::CleanedUp);
    }

    #[tokio::test]
    async fn test_failed_job_is_fatal() {
        let harness = Harness::new();
        let tcp = bound("old", "new");
        let mut resource = DatastoreMigrate::new(harness.ctx.clone());
        handle(&mut resource, &tcp).await.unwrap();

        finish(&harness, "Failed").await;
        let mut resource = DatastoreMigrate::new(harness.ctx.clone());
        assert_matches!(
            handle(&mut resource, &tcp).await,
            Err(Error::MigrationFailed { .. })
        );
    }

    #[tokio::test]
    async fn test_unbound_tenant_needs_no_migration() {
        let harness = Harness::new();
        let mut tcp = tenant("team-a", "alpha");
        tcp.annotations_mut()
            .insert(MIGRATION_TIMEOUT_ANNOTATION.to_string(), "10m".to_string());
        assert_eq!(
            migration_timeout(&tcp, Duration::from_secs(60)).unwrap(),
            Duration::from_secs(600)
        );

        let mut resource = DatastoreMigrate::new(harness.ctx.clone());
        assert_eq!(handle(&mut resource, &tcp).await.unwrap(), Outcome::Unchanged);
        assert_eq!(harness.store.writes(), 0);
    }

    async fn job_args(harness: &Harness) -> Option<Vec<String>> {
        let job = Objects::<Job>::namespaced(harness.ctx.store.clone(), "hangar-system")
            .get("migrate-team-a-alpha")
            .await
            .unwrap()?;
        job.spec?.template.spec?.containers[0].args.clone()
    }

    #[tokio::test]
    async fn test_job_for_previous_target_is_replaced() {
        let harness = Harness::new();
        let mut tcp = bound("old", "new");
        let mut resource = DatastoreMigrate::new(harness.ctx.clone());
        handle(&mut resource, &tcp).await.unwrap();
        apply_status(&resource, &mut tcp);
        finish(&harness, "Complete").await;

        // The desired DataStore moves again before the tenant was rebound
        tcp.spec.data_store = Some("third".into());
        let mut resource = DatastoreMigrate::new(harness.ctx.clone());
        assert_eq!(
            handle(&mut resource, &tcp).await.unwrap(),
            Outcome::Applied(OperationResult::Updated)
        );
        apply_status(&resource, &mut tcp);
        assert_eq!(tcp.version_phase(), Some(VersionPhase::Migrating));
        assert!(job_args(&harness).await.is_none());

        let mut resource = DatastoreMigrate::new(harness.ctx.clone());
        assert_eq!(
            handle(&mut resource, &tcp).await.unwrap(),
            Outcome::Applied(OperationResult::Created)
        );
        let args = job_args(&harness).await.unwrap();
        assert!(args.contains(&"--target-datastore=third".to_string()));

        // The new job has to finish before anything moves on
        let mut resource = DatastoreMigrate::new(harness.ctx.clone());
        assert!(handle(&mut resource, &tcp).await.unwrap_err().is_sentinel());
    }

    #[tokio::test]
    async fn test_delete_stops_running_job() {
        let harness = Harness::new();
        let tcp = bound("old", "new");
        let mut resource = DatastoreMigrate::new(harness.ctx.clone());
        handle(&mut resource, &tcp).await.unwrap();
        assert!(job_args(&harness).await.is_some());

        let mut resource = DatastoreMigrate::new(harness.ctx.clone());
        assert!(resource.delete(&tcp).await.unwrap());
        assert!(job_args(&harness).await.is_none());
        assert!(!resource.delete(&tcp).await.unwrap());
    }
}
