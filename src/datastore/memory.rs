//! In-memory backend used by tests
//!
//! Behaves like a SQL backend: databases, users and grants are plain sets
//! and every database holds a key/value table.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::{Connection, ConnectionFactory, ConnectionRef, Entry};
use crate::crd::{DataStore, DataStoreDriver};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct Backend {
    pub databases: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    pub users: BTreeMap<String, String>,
    pub grants: BTreeSet<(String, String)>,
    /// Mutating calls, in order, as `op:argument`
    pub journal: Vec<String>,
    /// Fail health checks
    pub unreachable: bool,
}

#[derive(Clone)]
pub struct MemoryConnection {
    driver: DataStoreDriver,
    backend: Arc<Mutex<Backend>>,
}

impl MemoryConnection {
    pub fn new(driver: DataStoreDriver) -> Self {
        Self {
            driver,
            backend: Arc::default(),
        }
    }

    pub fn backend(&self) -> parking_lot::MutexGuard<'_, Backend> {
        self.backend.lock()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn driver(&self) -> DataStoreDriver {
        self.driver
    }

    async fn check(&self) -> Result<()> {
        if self.backend.lock().unreachable {
            return Err(Error::DatastoreUnavailable {
                datastore: self.driver.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }

    async fn user_exists(&self, user: &str) -> Result<bool> {
        Ok(self.backend.lock().users.contains_key(user))
    }

    async fn create_user(&self, user: &str, password: &str) -> Result<()> {
        let mut backend = self.backend.lock();
        backend.users.insert(user.to_string(), password.to_string());
        backend.journal.push(format!("create_user:{user}"));
        Ok(())
    }

    async fn delete_user(&self, user: &str) -> Result<()> {
        let mut backend = self.backend.lock();
        backend.users.remove(user);
        backend.journal.push(format!("delete_user:{user}"));
        Ok(())
    }

    async fn db_exists(&self, db: &str) -> Result<bool> {
        Ok(self.backend.lock().databases.contains_key(db))
    }

    async fn create_db(&self, db: &str) -> Result<()> {
        let mut backend = self.backend.lock();
        backend.databases.entry(db.to_string()).or_default();
        backend.journal.push(format!("create_db:{db}"));
        Ok(())
    }

    async fn delete_db(&self, db: &str) -> Result<()> {
        let mut backend = self.backend.lock();
        backend.databases.remove(db);
        backend.journal.push(format!("delete_db:{db}"));
        Ok(())
    }

    async fn grant_privileges_exists(&self, user: &str, db: &str) -> Result<bool> {
        Ok(self
            .backend
            .lock()
            .grants
            .contains(&(user.to_string(), db.to_string())))
    }

    async fn grant_privileges(&self, user: &str, db: &str) -> Result<()> {
        let mut backend = self.backend.lock();
        backend.grants.insert((user.to_string(), db.to_string()));
        backend.journal.push(format!("grant:{user}@{db}"));
        Ok(())
    }

    async fn revoke_privileges(&self, user: &str, db: &str) -> Result<()> {
        let mut backend = self.backend.lock();
        backend.grants.remove(&(user.to_string(), db.to_string()));
        backend.journal.push(format!("revoke:{user}@{db}"));
        Ok(())
    }

    async fn export(&self, db: &str) -> Result<Vec<Entry>> {
        let backend = self.backend.lock();
        let table = backend.databases.get(db).ok_or_else(|| Error::ResourceNotFound {
            kind: "database".into(),
            name: db.to_string(),
        })?;
        Ok(table
            .iter()
            .map(|(key, value)| Entry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn import(&self, db: &str, entries: &[Entry]) -> Result<()> {
        let mut backend = self.backend.lock();
        let table = backend.databases.entry(db.to_string()).or_default();
        for entry in entries {
            table.insert(entry.key.clone(), entry.value.clone());
        }
        backend.journal.push(format!("import:{db}"));
        Ok(())
    }
}

/// Factory handing out connections to per-DataStore in-memory backends
#[derive(Default, Clone)]
pub struct MemoryFactory {
    backends: Arc<Mutex<BTreeMap<String, MemoryConnection>>>,
}

impl MemoryFactory {
    /// Register a backend for the DataStore called `name`
    pub fn register(&self, name: &str, driver: DataStoreDriver) -> MemoryConnection {
        let connection = MemoryConnection::new(driver);
        self.backends.lock().insert(name.to_string(), connection.clone());
        connection
    }

    pub fn connection(&self, name: &str) -> Option<MemoryConnection> {
        self.backends.lock().get(name).cloned()
    }
}

#[async_trait]
impl ConnectionFactory for MemoryFactory {
    async fn connect(&self, datastore: &DataStore) -> Result<ConnectionRef> {
        let name = kube::ResourceExt::name_any(datastore);
        let connection = self.connection(&name).ok_or_else(|| Error::DatastoreUnavailable {
            datastore: name.clone(),
            reason: "no such backend".into(),
        })?;
        Ok(Box::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::setup;

    #[tokio::test]
    async fn test_grant_is_idempotent() {
        let connection = MemoryConnection::new(DataStoreDriver::PostgreSQL);
        assert!(setup(&connection, "ns_a", "ns_a", "pw").await.unwrap());
        assert!(!setup(&connection, "ns_a", "ns_a", "pw").await.unwrap());
        assert!(connection.grant_privileges_exists("ns_a", "ns_a").await.unwrap());

        let journal = connection.backend().journal.clone();
        assert_eq!(journal, vec!["create_db:ns_a", "create_user:ns_a", "grant:ns_a@ns_a"]);
    }
}
