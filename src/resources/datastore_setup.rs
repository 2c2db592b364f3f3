//! Per-tenant database, user and grant on the bound DataStore
//!
//! Setup is skipped entirely while the recorded setup checksum equals the
//! checksum of the datastore configuration it was performed for. On tenant
//! deletion the grant, the user and the database are removed, in that order.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::datastore_config::{load_credentials, PASSWORD_KEY, SCHEMA_KEY, USER_KEY};
use super::{DeletableResource, Resource};
use crate::controllers::Context;
use crate::crd::{DataStore, TenantControlPlane, TenantControlPlaneStatus};
use crate::datastore::{self, ConnectionRef};
use crate::error::{Error, Result};
use crate::store::Objects;
use crate::utilities::OperationResult;

pub struct DatastoreSetup {
    ctx: Arc<Context>,
    datastore: String,
    schema: String,
    user: String,
    password: String,
    /// Checksum of the configuration this setup belongs to
    checksum: String,
}

impl DatastoreSetup {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            datastore: String::new(),
            schema: String::new(),
            user: String::new(),
            password: String::new(),
            checksum: String::new(),
        }
    }

    async fn connect(&self, name: &str) -> Result<Option<ConnectionRef>> {
        let datastores: Objects<DataStore> = Objects::all(self.ctx.store.clone());
        match datastores.get(name).await? {
            Some(datastore) => Ok(Some(self.ctx.connections.connect(&datastore).await?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Resource for DatastoreSetup {
    fn name(&self) -> &'static str {
        "datastore-setup"
    }

    async fn define(&mut self, tenant: &TenantControlPlane) -> Result<()> {
        let storage = tenant.status_or_default().storage;
        if storage.data_store_name.is_empty() {
            return Err(Error::missing(self.name(), "tenant is not bound to a datastore yet"));
        }
        self.datastore = storage.data_store_name;
        self.checksum = storage.config.checksum;

        let credentials = load_credentials(&self.ctx, tenant).await?;
        self.schema = credentials[SCHEMA_KEY].clone();
        self.user = credentials[USER_KEY].clone();
        self.password = credentials[PASSWORD_KEY].clone();
        Ok(())
    }

    async fn create_or_update(&mut self, tenant: &TenantControlPlane) -> Result<OperationResult> {
        let setup = tenant.status_or_default().storage.setup;
        if !setup.checksum.is_empty() && setup.checksum == self.checksum {
            return Ok(OperationResult::None);
        }

        let connection = self.connect(&self.datastore).await?.ok_or_else(|| Error::DatastoreUnavailable {
            datastore: self.datastore.clone(),
            reason: "DataStore not found".into(),
        })?;
        let driver = connection.driver().to_string();
        let changed = datastore::setup(connection.as_ref(), &self.schema, &self.user, &self.password).await?;
        self.ctx.metrics.datastore_operation(&driver, "setup");

        if changed {
            info!(tenant = %tenant.key(), datastore = %self.datastore, schema = %self.schema, "datastore prepared");
            return Ok(OperationResult::Created);
        }
        Ok(OperationResult::None)
    }

    fn should_status_be_updated(&self, tenant: &TenantControlPlane) -> bool {
        let setup = tenant.status_or_default().storage.setup;
        setup.checksum != self.checksum || setup.schema != self.schema || setup.user != self.user
    }

    fn update_status(&self, status: &mut TenantControlPlaneStatus) {
        let setup = &mut status.storage.setup;
        setup.schema = self.schema.clone();
        setup.user = self.user.clone();
        setup.checksum = self.checksum.clone();
        setup.last_update = Some(Utc::now());
    }
}

#[async_trait]
impl DeletableResource for DatastoreSetup {
    async fn delete(&mut self, tenant: &TenantControlPlane) -> Result<bool> {
        let storage = tenant.status_or_default().storage;
        if storage.setup.schema.is_empty() || storage.data_store_name.is_empty() {
            return Ok(false);
        }

        let Some(connection) = self.connect(&storage.data_store_name).await? else {
            warn!(
                tenant = %tenant.key(),
                datastore = %storage.data_store_name,
                "DataStore is gone, leaving tenant data behind"
            );
            return Ok(false);
        };
        let driver = connection.driver().to_string();
        let removed = datastore::teardown(connection.as_ref(), &storage.setup.schema, &storage.setup.user).await?;
        self.ctx.metrics.datastore_operation(&driver, "teardown");
        Ok(removed)
    }
}
