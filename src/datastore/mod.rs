//! Storage backend drivers
//!
//! A tenant's state lives in a shared backend described by a `DataStore`.
//! Each driver isolates tenants with three objects: a database (a key
//! prefix role for etcd), a login principal and a grant linking them.
//! [`Connection`] exposes the nine existence/create/delete operations over
//! those objects, plus the export/import pair used by migrations.

pub mod etcd;
#[cfg(test)]
pub mod memory;
pub mod migrate;
pub mod mysql;
pub mod postgresql;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::{ContentRef, DataStore, DataStoreDriver};
use crate::error::{Error, Result};
use crate::store::{ObjectStoreRef, Objects};

/// Upper bound for any single backend call
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// One key of a tenant's data, as moved by migrations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
}

// =============================================================================
// Connection Port
// =============================================================================

/// Administrative connection to a storage backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    fn driver(&self) -> DataStoreDriver;

    /// Cheap round trip proving the backend answers
    async fn check(&self) -> Result<()>;

    async fn user_exists(&self, user: &str) -> Result<bool>;
    async fn create_user(&self, user: &str, password: &str) -> Result<()>;
    async fn delete_user(&self, user: &str) -> Result<()>;

    async fn db_exists(&self, db: &str) -> Result<bool>;
    async fn create_db(&self, db: &str) -> Result<()>;
    async fn delete_db(&self, db: &str) -> Result<()>;

    async fn grant_privileges_exists(&self, user: &str, db: &str) -> Result<bool>;
    async fn grant_privileges(&self, user: &str, db: &str) -> Result<()>;
    async fn revoke_privileges(&self, user: &str, db: &str) -> Result<()>;

    /// Live keys of a tenant
    async fn export(&self, db: &str) -> Result<Vec<Entry>>;
    /// Write keys into a tenant's database, replacing existing values
    async fn import(&self, db: &str, entries: &[Entry]) -> Result<()>;
}

pub type ConnectionRef = Box<dyn Connection>;

/// Builds connections for DataStore objects
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, datastore: &DataStore) -> Result<ConnectionRef>;
}

// =============================================================================
// Connection Settings
// =============================================================================

/// Resolved TLS material
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    pub certificate_authority: String,
    pub client_certificate: Option<String>,
    pub client_key: Option<String>,
}

/// Everything a driver needs to open a connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// DataStore name, for error messages
    pub name: String,
    pub driver: DataStoreDriver,
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<TlsMaterial>,
}

impl ConnectionConfig {
    /// First endpoint split into host and port
    pub fn primary_endpoint(&self, default_port: u16) -> Result<(String, u16)> {
        let endpoint = self.endpoints.first().ok_or_else(|| Error::DatastoreUnavailable {
            datastore: self.name.clone(),
            reason: "no endpoints configured".into(),
        })?;
        split_endpoint(endpoint, default_port)
    }
}

/// Split `host:port` (scheme optional) into its parts
pub fn split_endpoint(endpoint: &str, default_port: u16) -> Result<(String, u16)> {
    let trimmed = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest)
        .trim_end_matches('/');
    match trimmed.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|e| Error::Configuration(format!("invalid port in endpoint {endpoint:?}: {e}")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((trimmed.to_string(), default_port)),
    }
}

/// Read a value from inline content or from a secret key
pub async fn resolve_content(store: &ObjectStoreRef, content: &ContentRef) -> Result<String> {
    if let Some(inline) = content.content.as_ref().filter(|c| !c.is_empty()) {
        return Ok(inline.clone());
    }
    let reference = content
        .secret_reference
        .as_ref()
        .ok_or_else(|| Error::Configuration("content reference has neither content nor secretReference".into()))?;

    let secrets: Objects<Secret> = Objects::namespaced(store.clone(), &reference.namespace);
    let secret = secrets.get_required(&reference.name).await?;
    let value = secret
        .data
        .as_ref()
        .and_then(|data| data.get(&reference.key_path))
        .ok_or_else(|| {
            Error::Configuration(format!(
                "secret {}/{} has no key {}",
                reference.namespace, reference.name, reference.key_path
            ))
        })?;
    String::from_utf8(value.0.clone())
        .map_err(|e| Error::Configuration(format!("secret {}/{} is not UTF-8: {e}", reference.namespace, reference.name)))
}

async fn resolve_optional(store: &ObjectStoreRef, content: Option<&ContentRef>) -> Result<Option<String>> {
    match content {
        Some(content) => Ok(Some(resolve_content(store, content).await?)),
        None => Ok(None),
    }
}

/// Resolve every reference of a DataStore into a [`ConnectionConfig`]
pub async fn connection_config(store: &ObjectStoreRef, datastore: &DataStore) -> Result<ConnectionConfig> {
    let spec = &datastore.spec;
    let (username, password) = match spec.basic_auth.as_ref() {
        Some(auth) => (
            Some(resolve_content(store, &auth.username).await?),
            Some(resolve_content(store, &auth.password).await?),
        ),
        None => (None, None),
    };

    let tls = match spec.tls_config.as_ref() {
        Some(tls) => {
            let client = tls.client_certificate.as_ref();
            Some(TlsMaterial {
                certificate_authority: resolve_content(store, &tls.certificate_authority.certificate).await?,
                client_certificate: resolve_optional(store, client.map(|c| &c.certificate)).await?,
                client_key: resolve_optional(store, client.and_then(|c| c.private_key.as_ref())).await?,
            })
        }
        None => None,
    };

    Ok(ConnectionConfig {
        name: kube::ResourceExt::name_any(datastore),
        driver: spec.driver,
        endpoints: spec.endpoints.clone(),
        username,
        password,
        tls,
    })
}

/// Factory opening real driver connections
pub struct DriverFactory {
    store: ObjectStoreRef,
}

impl DriverFactory {
    pub fn new(store: ObjectStoreRef) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ConnectionFactory for DriverFactory {
    async fn connect(&self, datastore: &DataStore) -> Result<ConnectionRef> {
        let config = connection_config(&self.store, datastore).await?;
        debug!(datastore = %config.name, driver = %config.driver, "opening datastore connection");
        let connection: ConnectionRef = match config.driver {
            DataStoreDriver::Etcd => Box::new(etcd::EtcdConnection::connect(&config).await?),
            DataStoreDriver::MySQL => Box::new(mysql::MySqlConnection::connect(&config).await?),
            DataStoreDriver::PostgreSQL => Box::new(postgresql::PostgresConnection::connect(&config).await?),
        };
        Ok(connection)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Reject identifiers that cannot be interpolated into DDL safely
pub fn validate_identifier(identifier: &str) -> Result<&str> {
    let valid = !identifier.is_empty()
        && identifier.len() <= 63
        && identifier
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(identifier)
    } else {
        Err(Error::InvalidIdentifier(identifier.to_string()))
    }
}

/// Passwords end up inside single-quoted SQL literals
pub fn validate_password(password: &str) -> Result<&str> {
    if password.is_empty() || !password.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::InvalidIdentifier("<password>".into()));
    }
    Ok(password)
}

/// Bound a backend call by [`OPERATION_TIMEOUT`]
pub async fn timed<T, F>(driver: DataStoreDriver, operation: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(OPERATION_TIMEOUT, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::DatastoreTimeout {
            driver: driver.to_string(),
            operation: operation.to_string(),
        }),
    }
}

/// Make sure database, user and grant exist, in that order.
/// Returns true when anything had to be created.
pub async fn setup(connection: &dyn Connection, db: &str, user: &str, password: &str) -> Result<bool> {
    validate_identifier(db)?;
    validate_identifier(user)?;
    let mut changed = false;

    if !connection.db_exists(db).await? {
        connection.create_db(db).await?;
        changed = true;
    }
    if !connection.user_exists(user).await? {
        connection.create_user(user, password).await?;
        changed = true;
    }
    if !connection.grant_privileges_exists(user, db).await? {
        connection.grant_privileges(user, db).await?;
        changed = true;
    }

    if changed {
        info!(driver = %connection.driver(), %db, %user, "datastore setup applied");
    }
    Ok(changed)
}

/// Remove grant, user and database, in that order.
/// Returns true when anything was deleted.
pub async fn teardown(connection: &dyn Connection, db: &str, user: &str) -> Result<bool> {
    validate_identifier(db)?;
    validate_identifier(user)?;
    let mut changed = false;

    if connection.grant_privileges_exists(user, db).await? {
        connection.revoke_privileges(user, db).await?;
        changed = true;
    }
    if connection.user_exists(user).await? {
        connection.delete_user(user).await?;
        changed = true;
    }
    if connection.db_exists(db).await? {
        connection.delete_db(db).await?;
        changed = true;
    }

    if changed {
        info!(driver = %connection.driver(), %db, %user, "datastore setup removed");
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DataStoreSpec, SecretKeyRef};
    use crate::store::memory::MemoryStore;
    use assert_matches::assert_matches;
    use kube::api::ObjectMeta;
    use mockall::{predicate::eq, Sequence};
    use std::sync::Arc;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("default_tenant_a").is_ok());
        assert_matches!(validate_identifier("tenant-a"), Err(Error::InvalidIdentifier(_)));
        assert_matches!(validate_identifier("a'; DROP"), Err(Error::InvalidIdentifier(_)));
        assert_matches!(validate_identifier(""), Err(Error::InvalidIdentifier(_)));
        assert!(validate_password("Abc123").is_ok());
        assert!(validate_password("a'b").is_err());
    }

    #[test]
    fn test_split_endpoint() {
        assert_eq!(split_endpoint("mysql:3306", 1).unwrap(), ("mysql".to_string(), 3306));
        assert_eq!(split_endpoint("https://etcd-0:2379/", 1).unwrap(), ("etcd-0".to_string(), 2379));
        assert_eq!(split_endpoint("postgres", 5432).unwrap(), ("postgres".to_string(), 5432));
        assert!(split_endpoint("host:notaport", 1).is_err());
    }

    #[tokio::test]
    async fn test_setup_creates_in_order_once() {
        let mut mock = MockConnection::new();
        let mut seq = Sequence::new();
        mock.expect_driver().return_const(DataStoreDriver::MySQL);
        mock.expect_db_exists().times(1).in_sequence(&mut seq).returning(|_| Ok(false));
        mock.expect_create_db()
            .with(eq("ns_tenant"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_user_exists().times(1).in_sequence(&mut seq).returning(|_| Ok(false));
        mock.expect_create_user()
            .with(eq("ns_tenant"), eq("secret"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_grant_privileges_exists()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(false));
        mock.expect_grant_privileges()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        assert!(setup(&mock, "ns_tenant", "ns_tenant", "secret").await.unwrap());
    }

    #[tokio::test]
    async fn test_setup_skips_existing_objects() {
        let mut mock = MockConnection::new();
        mock.expect_db_exists().returning(|_| Ok(true));
        mock.expect_user_exists().returning(|_| Ok(true));
        mock.expect_grant_privileges_exists().returning(|_, _| Ok(true));
        mock.expect_create_db().never();
        mock.expect_create_user().never();
        mock.expect_grant_privileges().never();

        assert!(!setup(&mock, "ns_tenant", "ns_tenant", "secret").await.unwrap());
    }

    #[tokio::test]
    async fn test_teardown_order() {
        let mut mock = MockConnection::new();
        let mut seq = Sequence::new();
        mock.expect_driver().return_const(DataStoreDriver::PostgreSQL);
        mock.expect_grant_privileges_exists()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(true));
        mock.expect_revoke_privileges()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_user_exists().times(1).in_sequence(&mut seq).returning(|_| Ok(true));
        mock.expect_delete_user().times(1).in_sequence(&mut seq).returning(|_| Ok(()));
        mock.expect_db_exists().times(1).in_sequence(&mut seq).returning(|_| Ok(true));
        mock.expect_delete_db().times(1).in_sequence(&mut seq).returning(|_| Ok(()));

        assert!(teardown(&mock, "ns_tenant", "ns_tenant").await.unwrap());
    }

    #[tokio::test]
    async fn test_setup_rejects_bad_identifier_before_any_call() {
        let mock = MockConnection::new();
        assert_matches!(
            setup(&mock, "bad-name", "user", "secret").await,
            Err(Error::InvalidIdentifier(_))
        );
    }

    #[tokio::test]
    async fn test_timed_reports_timeout() {
        tokio::time::pause();
        let result: Result<()> = timed(DataStoreDriver::Etcd, "user_get", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_matches!(result, Err(Error::DatastoreTimeout { .. }));
    }

    #[tokio::test]
    async fn test_connection_config_resolves_secret_refs() {
        let store = Arc::new(MemoryStore::new());
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("mysql-root".into()),
                namespace: Some("hangar-system".into()),
                ..Default::default()
            },
            data: Some([("password".to_string(), k8s_openapi::ByteString(b"rootpw".to_vec()))].into()),
            ..Default::default()
        };
        store.seed(&kube::api::ApiResource::erase::<Secret>(&()), Some("hangar-system"), &secret);

        let datastore = DataStore::new(
            "mysql",
            DataStoreSpec {
                driver: DataStoreDriver::MySQL,
                endpoints: vec!["mysql:3306".into()],
                basic_auth: Some(crate::crd::BasicAuth {
                    username: ContentRef {
                        content: Some("root".into()),
                        secret_reference: None,
                    },
                    password: ContentRef {
                        content: None,
                        secret_reference: Some(SecretKeyRef {
                            name: "mysql-root".into(),
                            namespace: "hangar-system".into(),
                            key_path: "password".into(),
                        }),
                    },
                }),
                tls_config: None,
            },
        );

        let store: ObjectStoreRef = store;
        let config = connection_config(&store, &datastore).await.unwrap();
        assert_eq!(config.username.as_deref(), Some("root"));
        assert_eq!(config.password.as_deref(), Some("rootpw"));
        assert_eq!(config.primary_endpoint(3306).unwrap(), ("mysql".to_string(), 3306));
    }
}
