//! MySQL driver
//!
//! Tenant API servers reach MySQL through kine, so a tenant is a database
//! holding the kine table, a user and an `ALL PRIVILEGES` grant on it.
//! Identifiers are validated before they are interpolated into statements.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlSslMode};
use sqlx::Row;

use super::{timed, validate_identifier, validate_password, Connection, ConnectionConfig, Entry, OPERATION_TIMEOUT};
use crate::crd::DataStoreDriver;
use crate::error::{Error, Result};

const DRIVER: DataStoreDriver = DataStoreDriver::MySQL;
const DEFAULT_PORT: u16 = 3306;

fn op_error(operation: &str, err: sqlx::Error) -> Error {
    Error::datastore(DRIVER, operation, err)
}

// =============================================================================
// Statements
// =============================================================================

fn create_database(db: &str) -> Result<String> {
    Ok(format!("CREATE DATABASE IF NOT EXISTS `{}`", validate_identifier(db)?))
}

fn drop_database(db: &str) -> Result<String> {
    Ok(format!("DROP DATABASE IF EXISTS `{}`", validate_identifier(db)?))
}

fn create_user(user: &str, password: &str) -> Result<String> {
    Ok(format!(
        "CREATE USER IF NOT EXISTS '{}'@'%' IDENTIFIED BY '{}'",
        validate_identifier(user)?,
        validate_password(password)?
    ))
}

fn drop_user(user: &str) -> Result<String> {
    Ok(format!("DROP USER IF EXISTS '{}'@'%'", validate_identifier(user)?))
}

fn grant(user: &str, db: &str) -> Result<String> {
    Ok(format!(
        "GRANT ALL PRIVILEGES ON `{}`.* TO '{}'@'%'",
        validate_identifier(db)?,
        validate_identifier(user)?
    ))
}

fn revoke(user: &str, db: &str) -> Result<String> {
    Ok(format!(
        "REVOKE ALL PRIVILEGES ON `{}`.* FROM '{}'@'%'",
        validate_identifier(db)?,
        validate_identifier(user)?
    ))
}

fn show_grants(user: &str) -> Result<String> {
    Ok(format!("SHOW GRANTS FOR '{}'@'%'", validate_identifier(user)?))
}

fn create_kine_table(db: &str) -> Result<String> {
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS `{}`.kine (\
         id BIGINT UNSIGNED AUTO_INCREMENT, \
         name VARCHAR(630) CHARACTER SET ascii, \
         created INTEGER, \
         deleted INTEGER, \
         create_revision BIGINT UNSIGNED, \
         prev_revision BIGINT UNSIGNED, \
         lease INTEGER, \
         value MEDIUMBLOB, \
         old_value MEDIUMBLOB, \
         PRIMARY KEY (id))",
        validate_identifier(db)?
    ))
}

/// Latest live revision of every key
fn select_live_keys(db: &str) -> Result<String> {
    let db = validate_identifier(db)?;
    Ok(format!(
        "SELECT k.name, k.value FROM `{db}`.kine k \
         JOIN (SELECT name, MAX(id) AS id FROM `{db}`.kine GROUP BY name) latest ON k.id = latest.id \
         WHERE k.deleted = 0 AND k.name NOT LIKE 'compact_rev_key%'"
    ))
}

fn insert_key(db: &str) -> Result<String> {
    Ok(format!(
        "INSERT INTO `{}`.kine (name, created, deleted, create_revision, prev_revision, lease, value, old_value) \
         VALUES (?, 1, 0, 0, 0, 0, ?, NULL)",
        validate_identifier(db)?
    ))
}

/// Whether one line of `SHOW GRANTS` grants everything on `db`
fn is_full_grant(line: &str, db: &str) -> bool {
    let normalized = line.replace('`', "");
    normalized.starts_with("GRANT ALL PRIVILEGES ON ") && normalized.contains(&format!(" ON {db}.* TO "))
}

// =============================================================================
// Connection
// =============================================================================

pub struct MySqlConnection {
    pool: MySqlPool,
}

impl MySqlConnection {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let (host, port) = config.primary_endpoint(DEFAULT_PORT)?;
        let mut options = MySqlConnectOptions::new().host(&host).port(port);
        if let Some(user) = config.username.as_deref() {
            options = options.username(user);
        }
        if let Some(password) = config.password.as_deref() {
            options = options.password(password);
        }
        match config.tls.as_ref() {
            Some(tls) => {
                options = options
                    .ssl_mode(MySqlSslMode::VerifyCa)
                    .ssl_ca_from_pem(tls.certificate_authority.as_bytes().to_vec());
                if let (Some(cert), Some(key)) = (tls.client_certificate.as_ref(), tls.client_key.as_ref()) {
                    options = options
                        .ssl_client_cert_from_pem(cert.as_bytes())
                        .ssl_client_key_from_pem(key.as_bytes());
                }
            }
            None => options = options.ssl_mode(MySqlSslMode::Disabled),
        }

        tracing::info!(%host, port, datastore = %config.name, "connecting to MySQL");
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(OPERATION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| Error::DatastoreUnavailable {
                datastore: config.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { pool })
    }

    async fn execute(&self, operation: &str, statement: String) -> Result<()> {
        timed(DRIVER, operation, async {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| op_error(operation, e))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    fn driver(&self) -> DataStoreDriver {
        DRIVER
    }

    async fn check(&self) -> Result<()> {
        self.execute("ping", "SELECT 1".to_string()).await
    }

    async fn user_exists(&self, user: &str) -> Result<bool> {
        timed(DRIVER, "user_exists", async {
            let found: Option<String> = sqlx::query_scalar("SELECT User FROM mysql.user WHERE User = ?")
                .bind(user)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| op_error("user_exists", e))?;
            Ok(found.is_some())
        })
        .await
    }

    async fn create_user(&self, user: &str, password: &str) -> Result<()> {
        self.execute("create_user", create_user(user, password)?).await
    }

    async fn delete_user(&self, user: &str) -> Result<()> {
        self.execute("delete_user", drop_user(user)?).await
    }

    async fn db_exists(&self, db: &str) -> Result<bool> {
        timed(DRIVER, "db_exists", async {
            let found: Option<String> =
                sqlx::query_scalar("SELECT SCHEMA_NAME FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME = ?")
                    .bind(db)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| op_error("db_exists", e))?;
            Ok(found.is_some())
        })
        .await
    }

    async fn create_db(&self, db: &str) -> Result<()> {
        self.execute("create_db", create_database(db)?).await
    }

    async fn delete_db(&self, db: &str) -> Result<()> {
        self.execute("delete_db", drop_database(db)?).await
    }

    async fn grant_privileges_exists(&self, user: &str, db: &str) -> Result<bool> {
        if !self.user_exists(user).await? {
            return Ok(false);
        }
        let statement = show_grants(user)?;
        timed(DRIVER, "show_grants", async {
            let lines: Vec<String> = sqlx::query_scalar(&statement)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| op_error("show_grants", e))?;
            Ok(lines.iter().any(|line| is_full_grant(line, db)))
        })
        .await
    }

    async fn grant_privileges(&self, user: &str, db: &str) -> Result<()> {
        self.execute("grant_privileges", grant(user, db)?).await
    }

    async fn revoke_privileges(&self, user: &str, db: &str) -> Result<()> {
        self.execute("revoke_privileges", revoke(user, db)?).await
    }

    async fn export(&self, db: &str) -> Result<Vec<Entry>> {
        let statement = select_live_keys(db)?;
        timed(DRIVER, "export", async {
            let rows = sqlx::query(&statement)
                .fetch_all(&self.pool)
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
        .await
    }

    async fn import(&self, db: &str, entries: &[Entry]) -> Result<()> {
        self.execute("import", create_kine_table(db)?).await?;
        let statement = insert_key(db)?;
        for entry in entries {
            timed(DRIVER, "import", async {
                sqlx::query(&statement)
                    .bind(&entry.key)
                    .bind(&entry.value)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| op_error("import", e))?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }
}
