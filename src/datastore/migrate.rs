//! Data copy performed by the `migrate` subcommand
//!
//! Runs inside the migration Job: prepares the tenant's database on the
//! target DataStore and copies every live key from the DataStore the tenant
//! is currently bound to. Both DataStores must use the same driver.

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use std::time::Duration;
use tracing::info;

use super::{setup, ConnectionFactory};
use crate::crd::{DataStore, TenantControlPlane};
use crate::error::{Error, Result};
use crate::resources::datastore_config::{PASSWORD_KEY, SCHEMA_KEY, USER_KEY};
use crate::resources::secret_value;
use crate::store::{ObjectStoreRef, Objects};

/// Arguments of one migration
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub tenant_namespace: String,
    pub tenant_name: String,
    pub target_datastore: String,
    pub timeout: Duration,
}

/// Copy the tenant's data to the target DataStore. Returns the number of
/// keys copied.
pub async fn migrate(store: &ObjectStoreRef, connections: &dyn ConnectionFactory, request: &MigrationRequest) -> Result<usize> {
    let tenant_key = format!("{}/{}", request.tenant_namespace, request.tenant_name);
    let failed = |reason: String| Error::MigrationFailed {
        tenant: tenant_key.clone(),
        reason,
    };

    match tokio::time::timeout(request.timeout, copy(store, connections, request)).await {
        Ok(Ok(copied)) => Ok(copied),
        Ok(Err(err @ Error::MigrationFailed { .. })) => Err(err),
        Ok(Err(err)) => Err(failed(err.to_string())),
        Err(_) => Err(failed(format!("timed out after {:?}", request.timeout))),
    }
}

async fn copy(store: &ObjectStoreRef, connections: &dyn ConnectionFactory, request: &MigrationRequest) -> Result<usize> {
    let tenants: Objects<TenantControlPlane> = Objects::namespaced(store.clone(), &request.tenant_namespace);
    let tenant = tenants.get_required(&request.tenant_name).await?;

    let source_name = tenant
        .bound_datastore()
        .ok_or_else(|| Error::missing("migrate", "tenant is not bound to a datastore"))?;
    if source_name == request.target_datastore {
        info!(tenant = %tenant.key(), datastore = %source_name, "tenant already bound to target, nothing to copy");
        return Ok(0);
    }

    let datastores: Objects<DataStore> = Objects::all(store.clone());
    let source = datastores.get_required(&source_name).await?;
    let target = datastores.get_required(&request.target_datastore).await?;
    if source.spec.driver != target.spec.driver {
        return Err(Error::MigrationFailed {
            tenant: tenant.key(),
            reason: format!(
                "cannot migrate from {} ({}) to {} ({})",
                source.name_any(),
                source.spec.driver,
                target.name_any(),
                target.spec.driver
            ),
        });
    }

    let config = tenant.status_or_default().storage.config;
    let secrets: Objects<Secret> = Objects::namespaced(store.clone(), &tenant.namespace_or_default());
    let secret = secrets.get_required(&config.secret_name).await?;
    let read = |key: &str| {
        secret_value(&secret, key)
            .ok_or_else(|| Error::Configuration(format!("secret {} has no {key}", config.secret_name)))
    };
    let (schema, user, password) = (read(SCHEMA_KEY)?, read(USER_KEY)?, read(PASSWORD_KEY)?);

    let source_connection = connections.connect(&source).await?;
    let target_connection = connections.connect(&target).await?;

    setup(target_connection.as_ref(), &schema, &user, &password).await?;
    let entries = source_connection.export(&schema).await?;
    target_connection.import(&schema, &entries).await?;

    info!(
        tenant = %tenant.key(),
        from = %source.name_any(),
        to = %target.name_any(),
        keys = entries.len(),
        "tenant data copied"
    );
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::tenant_control_plane::tests::tenant;
    use crate::crd::DataStoreDriver;
    use crate::datastore::Connection;
    use crate::resources::datastore_config::DatastoreConfig;
    use crate::resources::testing::{apply_status, Harness};
    use crate::resources::handle;
    use assert_matches::assert_matches;

    async fn bound_tenant(harness: &Harness) -> TenantControlPlane {
        let mut tcp = tenant("team-a", "alpha");
        let mut config = DatastoreConfig::new(harness.ctx.clone());
        handle(&mut config, &tcp).await.unwrap();
        apply_status(&config, &mut tcp);
        harness.tenant(tcp).await
    }

    fn request(target: &str) -> MigrationRequest {
        MigrationRequest {
            tenant_namespace: "team-a".into(),
            tenant_name: "alpha".into(),
            target_datastore: target.into(),
            timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_keys_are_copied() {
        let harness = Harness::new();
        harness.datastore("default", DataStoreDriver::MySQL).await;
        harness.datastore("target", DataStoreDriver::MySQL).await;
        let schema = bound_tenant(&harness).await.datastore_schema();

        let source = harness.backends.connection("default").unwrap();
        source.create_db(&schema).await.unwrap();
        source
            .backend()
            .databases
            .get_mut(&schema)
            .unwrap()
            .insert("/registry/pods/default/web".into(), b"pod".to_vec());

        let copied = migrate(&harness.ctx.store, harness.ctx.connections.as_ref(), &request("target"))
            .await
            .unwrap();
        assert_eq!(copied, 1);

        let target = harness.backends.connection("target").unwrap();
        let backend = target.backend();
        assert_eq!(backend.databases[&schema]["/registry/pods/default/web"], b"pod".to_vec());
        assert!(backend.users.contains_key(&schema));
        assert!(backend.grants.contains(&(schema.clone(), schema.clone())));
    }

    #[tokio::test]
    async fn test_cross_driver_is_rejected() {
        let harness = Harness::new();
        harness.datastore("default", DataStoreDriver::MySQL).await;
        harness.datastore("target", DataStoreDriver::PostgreSQL).await;
        bound_tenant(&harness).await;

        assert_matches!(
            migrate(&harness.ctx.store, harness.ctx.connections.as_ref(), &request("target")).await,
            Err(Error::MigrationFailed { .. })
        );
    }

    #[tokio::test]
    async fn test_same_datastore_is_a_no_op() {
        let harness = Harness::new();
        harness.datastore("default", DataStoreDriver::Etcd).await;
        bound_tenant(&harness).await;
        let copied = migrate(&harness.ctx.store, harness.ctx.connections.as_ref(), &request("default"))
            .await
            .unwrap();
        assert_eq!(copied, 0);
    }
}
