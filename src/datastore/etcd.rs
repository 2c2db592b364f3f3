//! etcd driver
//!
//! Tenants are isolated by key prefix: the "database" is a role, the user
//! has no password (tenant API servers authenticate with client
//! certificates) and the grant is the role's read-write permission over
//! `/{db}/` together with the role assignment. Both halves of the grant are
//! idempotent in etcd, so a grant interrupted halfway is completed by the
//! next attempt.

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, DeleteOptions, GetOptions, Identity, Permission, TlsOptions,
    UserAddOptions,
};
use tracing::debug;

use super::{timed, Connection, ConnectionConfig, Entry, OPERATION_TIMEOUT};
use crate::crd::DataStoreDriver;
use crate::error::{Error, Result};

const DRIVER: DataStoreDriver = DataStoreDriver::Etcd;

/// Key prefix owned by a tenant
pub fn key_prefix(db: &str) -> String {
    format!("/{db}/")
}

/// Smallest key greater than every key starting with `prefix`
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Prefix made only of 0xff bytes: range extends to the end of the keyspace
    vec![0]
}

/// etcd answers lookups of unknown users/roles with an error status
fn is_not_found(err: &etcd_client::Error) -> bool {
    let message = err.to_string();
    message.contains("user name not found") || message.contains("role name not found")
}

fn op_error(operation: &str, err: etcd_client::Error) -> Error {
    Error::datastore(DRIVER, operation, err)
}

/// One auth API call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    RoleAdd { role: String },
    /// Read-write over `[key, range_end)`
    RoleGrantPermission { role: String, key: Vec<u8>, range_end: Vec<u8> },
    UserGrantRole { user: String, role: String },
}

impl AuthStep {
    fn operation(&self) -> &'static str {
        match self {
            AuthStep::RoleAdd { .. } => "role_add",
            AuthStep::RoleGrantPermission { .. } => "role_grant_permission",
            AuthStep::UserGrantRole { .. } => "user_grant_role",
        }
    }
}

pub fn create_db_steps(db: &str) -> Vec<AuthStep> {
    vec![AuthStep::RoleAdd { role: db.to_string() }]
}

pub fn grant_steps(user: &str, db: &str) -> Vec<AuthStep> {
    let prefix = key_prefix(db);
    vec![
        AuthStep::RoleGrantPermission {
            role: db.to_string(),
            key: prefix.as_bytes().to_vec(),
            range_end: prefix_range_end(prefix.as_bytes()),
        },
        AuthStep::UserGrantRole {
            user: user.to_string(),
            role: db.to_string(),
        },
    ]
}

pub struct EtcdConnection {
    client: Client,
}

impl EtcdConnection {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(OPERATION_TIMEOUT)
            .with_timeout(OPERATION_TIMEOUT);

        if let Some(tls) = config.tls.as_ref() {
            let mut tls_options =
                TlsOptions::new().ca_certificate(Certificate::from_pem(tls.certificate_authority.as_bytes()));
            if let (Some(cert), Some(key)) = (tls.client_certificate.as_ref(), tls.client_key.as_ref()) {
                tls_options = tls_options.identity(Identity::from_pem(cert.as_bytes(), key.as_bytes()));
            }
            options = options.with_tls(tls_options);
        }
        if let (Some(user), Some(password)) = (config.username.as_ref(), config.password.as_ref()) {
            options = options.with_user(user.clone(), password.clone());
        }

        let client = Client::connect(config.endpoints.clone(), Some(options))
            .await
            .map_err(|e| Error::DatastoreUnavailable {
                datastore: config.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }

    /// `Client` calls take `&mut self`; clones share the same channel
    fn client(&self) -> Client {
        self.client.clone()
    }

    async fn run(&self, steps: Vec<AuthStep>) -> Result<()> {
        let mut client = self.client();
        for step in steps {
            let operation = step.operation();
            timed(DRIVER, operation, async {
                let result = match step {
                    AuthStep::RoleAdd { role } => client.role_add(role).await.map(|_| ()),
                    AuthStep::RoleGrantPermission { role, key, range_end } => client
                        .role_grant_permission(role, Permission::read_write(key).with_range_end(range_end))
                        .await
                        .map(|_| ()),
                    AuthStep::UserGrantRole { user, role } => client.user_grant_role(user, role).await.map(|_| ()),
                };
                result.map_err(|e| op_error(operation, e))
            })
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for EtcdConnection {
    fn driver(&self) -> DataStoreDriver {
        DRIVER
    }

    async fn check(&self) -> Result<()> {
        timed(DRIVER, "status", async {
            self.client().status().await.map_err(|e| op_error("status", e))?;
            Ok(())
        })
        .await
    }

    async fn user_exists(&self, user: &str) -> Result<bool> {
        timed(DRIVER, "user_get", async {
            match self.client().user_get(user).await {
                Ok(_) => Ok(true),
                Err(e) if is_not_found(&e) => Ok(false),
                Err(e) => Err(op_error("user_get", e)),
            }
        })
        .await
    }

    async fn create_user(&self, user: &str, _password: &str) -> Result<()> {
        timed(DRIVER, "user_add", async {
            self.client()
                .user_add(user, "", Some(UserAddOptions::new().with_no_pwd()))
                .await
                .map_err(|e| op_error("user_add", e))?;
            Ok(())
        })
        .await
    }

    async fn delete_user(&self, user: &str) -> Result<()> {
        timed(DRIVER, "user_delete", async {
            match self.client().user_delete(user).await {
                Ok(_) => Ok(()),
                Err(e) if is_not_found(&e) => Ok(()),
                Err(e) => Err(op_error("user_delete", e)),
            }
        })
        .await
    }

    async fn db_exists(&self, db: &str) -> Result<bool> {
        timed(DRIVER, "role_get", async {
            match self.client().role_get(db).await {
                Ok(_) => Ok(true),
                Err(e) if is_not_found(&e) => Ok(false),
                Err(e) => Err(op_error("role_get", e)),
            }
        })
        .await
    }

    async fn create_db(&self, db: &str) -> Result<()> {
        self.run(create_db_steps(db)).await
    }

    async fn delete_db(&self, db: &str) -> Result<()> {
        timed(DRIVER, "role_delete", async {
            let mut client = self.client();
            let prefix = key_prefix(db);
            let deleted = client
                .delete(prefix.as_bytes(), Some(DeleteOptions::new().with_prefix()))
                .await
                .map_err(|e| op_error("delete", e))?;
            debug!(%db, keys = deleted.deleted(), "wiped tenant prefix");

            match client.role_delete(db).await {
                Ok(_) => Ok(()),
                Err(e) if is_not_found(&e) => Ok(()),
                Err(e) => Err(op_error("role_delete", e)),
            }
        })
        .await
    }

    async fn grant_privileges_exists(&self, user: &str, db: &str) -> Result<bool> {
        timed(DRIVER, "role_get", async {
            let mut client = self.client();
            let role = match client.role_get(db).await {
                Ok(role) => role,
                Err(e) if is_not_found(&e) => return Ok(false),
                Err(e) => return Err(op_error("role_get", e)),
            };

            let prefix = key_prefix(db);
            let range_end = prefix_range_end(prefix.as_bytes());
            let scoped = role
                .permissions()
                .iter()
                .any(|p| p.key() == prefix.as_bytes() && p.range_end() == range_end.as_slice());
            if !scoped {
                return Ok(false);
            }

            match client.user_get(user).await {
                Ok(found) => Ok(found.roles().iter().any(|r| r == db)),
                Err(e) if is_not_found(&e) => Ok(false),
                Err(e) => Err(op_error("user_get", e)),
            }
        })
        .await
    }

    async fn grant_privileges(&self, user: &str, db: &str) -> Result<()> {
        self.run(grant_steps(user, db)).await
    }

    async fn revoke_privileges(&self, user: &str, db: &str) -> Result<()> {
        timed(DRIVER, "user_revoke_role", async {
            match self.client().user_revoke_role(user, db).await {
                Ok(_) => Ok(()),
                Err(e) if is_not_found(&e) => Ok(()),
                Err(e) => Err(op_error("user_revoke_role", e)),
            }
        })
        .await
    }

    async fn export(&self, db: &str) -> Result<Vec<Entry>> {
        timed(DRIVER, "get", async {
            let prefix = key_prefix(db);
            let response = self
                .client()
                .get(prefix.as_bytes(), Some(GetOptions::new().with_prefix()))
                .await
                .map_err(|e| op_error("get", e))?;
            response
                .kvs()
                .iter()
                .map(|kv| {
                    Ok(Entry {
                        key: kv.key_str().map_err(|e| op_error("get", e))?.to_string(),
                        value: kv.value().to_vec(),
                    })
                })
                .collect()
        })
        .await
    }

    async fn import(&self, db: &str, entries: &[Entry]) -> Result<()> {
        let prefix = key_prefix(db);
        let mut client = self.client();
        for entry in entries {
            if !entry.key.starts_with(&prefix) {
                return Err(Error::datastore(
                    DRIVER,
                    "put",
                    format!("key {} is outside of prefix {prefix}", entry.key),
                ));
            }
            timed(DRIVER, "put", async {
                client
                    .put(entry.key.as_bytes(), entry.value.clone(), None)
                    .await
                    .map_err(|e| op_error("put", e))?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }
}
