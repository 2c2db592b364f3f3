//! PostgreSQL driver
//!
//! A tenant is a database owned by a login role. Ownership is handed back
//! to the administrative role before the grant is revoked so the database
//! can be dropped afterwards.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::Row;

use super::{timed, validate_identifier, validate_password, Connection, ConnectionConfig, Entry, OPERATION_TIMEOUT};
use crate::crd::DataStoreDriver;
use crate::error::{Error, Result};

const DRIVER: DataStoreDriver = DataStoreDriver::PostgreSQL;
const DEFAULT_PORT: u16 = 5432;

fn op_error(operation: &str, err: sqlx::Error) -> Error {
    Error::datastore(DRIVER, operation, err)
}

// =============================================================================
// Statements
// =============================================================================

fn create_database(db: &str) -> Result<String> {
    Ok(format!("CREATE DATABASE {}", validate_identifier(db)?))
}

fn drop_database(db: &str) -> Result<String> {
    Ok(format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", validate_identifier(db)?))
}

fn create_role(user: &str, password: &str) -> Result<String> {
    Ok(format!(
        "CREATE ROLE {} LOGIN PASSWORD '{}'",
        validate_identifier(user)?,
        validate_password(password)?
    ))
}

fn drop_role(user: &str) -> Result<String> {
    Ok(format!("DROP ROLE IF EXISTS {}", validate_identifier(user)?))
}

fn grant(user: &str, db: &str) -> Result<Vec<String>> {
    let (user, db) = (validate_identifier(user)?, validate_identifier(db)?);
    Ok(vec![
        format!("GRANT ALL PRIVILEGES ON DATABASE {db} TO {user}"),
        format!("ALTER DATABASE {db} OWNER TO {user}"),
    ])
}

fn revoke(user: &str, db: &str) -> Result<Vec<String>> {
    let (user, db) = (validate_identifier(user)?, validate_identifier(db)?);
    Ok(vec![
        format!("ALTER DATABASE {db} OWNER TO CURRENT_USER"),
        format!("REVOKE ALL PRIVILEGES ON DATABASE {db} FROM {user}"),
    ])
}

const CREATE_KINE_TABLE: &str = "CREATE TABLE IF NOT EXISTS kine (\
     id SERIAL PRIMARY KEY, \
     name VARCHAR(630), \
     created INTEGER, \
     deleted INTEGER, \
     create_revision INTEGER, \
     prev_revision INTEGER, \
     lease INTEGER, \
     value BYTEA, \
     old_value BYTEA)";

const SELECT_LIVE_KEYS: &str = "SELECT k.name, k.value FROM kine k \
     JOIN (SELECT name, MAX(id) AS id FROM kine GROUP BY name) latest ON k.id = latest.id \
     WHERE k.deleted = 0 AND k.name NOT LIKE 'compact_rev_key%'";

const INSERT_KEY: &str = "INSERT INTO kine (name, created, deleted, create_revision, prev_revision, lease, value, old_value) \
     VALUES ($1, 1, 0, 0, 0, 0, $2, NULL)";

// =============================================================================
// Connection
// =============================================================================

pub struct PostgresConnection {
    options: PgConnectOptions,
    pool: PgPool,
}

async fn open_pool(options: PgConnectOptions, datastore: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(OPERATION_TIMEOUT)
        .connect_with(options)
        .await
        .map_err(|e| Error::DatastoreUnavailable {
            datastore: datastore.to_string(),
            reason: e.to_string(),
        })
}

impl PostgresConnection {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let (host, port) = config.primary_endpoint(DEFAULT_PORT)?;
        let mut options = PgConnectOptions::new().host(&host).port(port).database("postgres");
        if let Some(user) = config.username.as_deref() {
            options = options.username(user);
        }
        if let Some(password) = config.password.as_deref() {
            options = options.password(password);
        }
        match config.tls.as_ref() {
            Some(tls) => {
                options = options
                    .ssl_mode(PgSslMode::VerifyCa)
                    .ssl_root_cert_from_pem(tls.certificate_authority.as_bytes().to_vec());
                if let (Some(cert), Some(key)) = (tls.client_certificate.as_ref(), tls.client_key.as_ref()) {
                    options = options
                        .ssl_client_cert_from_pem(cert.as_bytes())
                        .ssl_client_key_from_pem(key.as_bytes());
                }
            }
            None => options = options.ssl_mode(PgSslMode::Disable),
        }

        tracing::info!(%host, port, datastore = %config.name, "connecting to PostgreSQL");
        let pool = open_pool(options.clone(), &config.name).await?;
        Ok(Self { options, pool })
    }

    async fn execute(&self, operation: &str, statement: &str) -> Result<()> {
        timed(DRIVER, operation, async {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| op_error(operation, e))?;
            Ok(())
        })
        .await
    }

    async fn exists(&self, operation: &str, query: &str, value: &str) -> Result<bool> {
        timed(DRIVER, operation, async {
            let found = sqlx::query(query)
                .bind(value)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| op_error(operation, e))?;
            Ok(found.is_some())
        })
        .await
    }

    /// Short-lived pool on the tenant's own database
    async fn tenant_pool(&self, db: &str) -> Result<PgPool> {
        let options = self.options.clone().database(validate_identifier(db)?);
        open_pool(options, db).await
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn driver(&self) -> DataStoreDriver {
        DRIVER
    }

    async fn check(&self) -> Result<()> {
        self.execute("ping", "SELECT 1").await
    }

    async fn user_exists(&self, user: &str) -> Result<bool> {
        self.exists("user_exists", "SELECT 1 FROM pg_roles WHERE rolname = $1", user)
            .await
    }

    async fn create_user(&self, user: &str, password: &str) -> Result<()> {
        self.execute("create_user", &create_role(user, password)?).await
    }

    async fn delete_user(&self, user: &str) -> Result<()> {
        self.execute("delete_user", &drop_role(user)?).await
    }

    async fn db_exists(&self, db: &str) -> Result<bool> {
        self.exists("db_exists", "SELECT 1 FROM pg_database WHERE datname = $1", db)
            .await
    }

    async fn create_db(&self, db: &str) -> Result<()> {
        self.execute("create_db", &create_database(db)?).await
    }

    async fn delete_db(&self, db: &str) -> Result<()> {
        self.execute("delete_db", &drop_database(db)?).await
    }

    async fn grant_privileges_exists(&self, user: &str, db: &str) -> Result<bool> {
        if !self.user_exists(user).await? || !self.db_exists(db).await? {
            return Ok(false);
        }
        timed(DRIVER, "grant_privileges_exists", async {
            let granted: bool = sqlx::query_scalar("SELECT has_database_privilege($1, $2, 'CREATE')")
                .bind(user)
                .bind(db)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| op_error("grant_privileges_exists", e))?;
            Ok(granted)
        })
        .await
    }

    async fn grant_privileges(&self, user: &str, db: &str) -> Result<()> {
        for statement in grant(user, db)? {
            self.execute("grant_privileges", &statement).await?;
        }
        Ok(())
    }

    async fn revoke_privileges(&self, user: &str, db: &str) -> Result<()> {
        for statement in revoke(user, db)? {
            self.execute("revoke_privileges", &statement).await?;
        }
        Ok(())
    }

    async fn export(&self, db: &str) -> Result<Vec<Entry>> {
        let pool = self.tenant_pool(db).await?;
        let result = timed(DRIVER, "export", async {
            let rows = sqlx::query(SELECT_LIVE_KEYS)
                .fetch_all(&pool)
                .await
                .map_err(|e| op_error("export", e))?;
            rows.iter()
                .map(|row| {
                    Ok(Entry {
                        key: row.try_get("name").map_err(|e| op_error("export", e))?,
                        value: row.try_get("value").map_err(|e| op_error("export", e))?,
                    })
                })
                .collect()
        })
        .await;
        pool.close().await;
        result
    }

    async fn import(&self, db: &str, entries: &[Entry]) -> Result<()> {
        let pool = self.tenant_pool(db).await?;
        let result = async {
            timed(DRIVER, "import", async {
                sqlx::query(CREATE_KINE_TABLE)
                    .execute(&pool)
                    .await
                    .map_err(|e| op_error("import", e))?;
                Ok(())
            })
            .await?;
            for entry in entries {
                timed(DRIVER, "import", async {
                    sqlx::query(INSERT_KEY)
                        .bind(&entry.key)
                        .bind(&entry.value)
                        .execute(&pool)
                        .await
                        .map_err(|e| op_error("import", e))?;
                    Ok(())
                })
                .await?;
            }
            Ok::<(), Error>(())
        }
        .await;
        pool.close().await;
        result
    }
}
