//! Conflict-safe upsert
//!
//! Read the current object, apply a mutation, write it back only when the
//! mutation changed something. Optimistic-concurrency conflicts restart the
//! whole read-mutate-write cycle on a bounded, fixed backoff schedule.

use backoff::backoff::Backoff;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::Objects;

/// What an upsert did to the remote object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    /// Object already matched the desired state
    None,
    Created,
    Updated,
}

impl std::fmt::Display for OperationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationResult::None => write!(f, "unchanged"),
            OperationResult::Created => write!(f, "created"),
            OperationResult::Updated => write!(f, "updated"),
        }
    }
}

// =============================================================================
// Retry Schedule
// =============================================================================

/// Fixed-interval schedule with a bounded number of retries
#[derive(Debug, Clone)]
pub struct ConflictBackoff {
    interval: Duration,
    retries: u32,
    remaining: u32,
}

impl ConflictBackoff {
    pub fn new(interval: Duration, retries: u32) -> Self {
        Self {
            interval,
            retries,
            remaining: retries,
        }
    }
}

impl Default for ConflictBackoff {
    /// Five retries, 10ms apart
    fn default() -> Self {
        Self::new(Duration::from_millis(10), 5)
    }
}

impl Backoff for ConflictBackoff {
    fn reset(&mut self) {
        self.remaining = self.retries;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.interval)
    }
}

/// Wait before the next attempt when `err` is a conflict and the schedule
/// allows another try. Any other error is handed back unchanged.
pub(crate) async fn backoff_on_conflict(schedule: &mut ConflictBackoff, err: Error, kind: &str, name: &str) -> Result<()> {
    if !matches!(err, Error::Conflict { .. }) {
        return Err(err);
    }
    match schedule.next_backoff() {
        Some(delay) => {
            debug!(%kind, %name, delay_ms = delay.as_millis() as u64, "write conflict, retrying");
            tokio::time::sleep(delay).await;
            Ok(())
        }
        None => Err(Error::ConflictRetriesExhausted {
            kind: kind.to_string(),
            name: name.to_string(),
        }),
    }
}

fn unchanged<K: Serialize>(before: &K, after: &K) -> Result<bool> {
    Ok(serde_json::to_value(before)? == serde_json::to_value(after)?)
}

// =============================================================================
// Upsert Operations
// =============================================================================

/// Create `name` if absent, otherwise mutate the live object and write it
/// back when the mutation changed it. `mutate` may run several times.
pub async fn create_or_update<K, F>(
    objects: &Objects<K>,
    name: &str,
    mut mutate: F,
) -> Result<(OperationResult, K)>
where
    K: Resource<DynamicType = ()> + Clone + Default + Serialize + DeserializeOwned + Send + Sync,
    F: FnMut(&mut K) -> Result<()> + Send,
{
    let mut schedule = ConflictBackoff::default();
    loop {
        match try_create_or_update(objects, name, &mut mutate).await {
            Err(err) => backoff_on_conflict(&mut schedule, err, objects.kind(), name).await?,
            done => return done,
        }
    }
}

async fn try_create_or_update<K, F>(objects: &Objects<K>, name: &str, mutate: &mut F) -> Result<(OperationResult, K)>
where
    K: Resource<DynamicType = ()> + Clone + Default + Serialize + DeserializeOwned + Send + Sync,
    F: FnMut(&mut K) -> Result<()> + Send,
{
    match objects.get(name).await? {
        None => {
            let mut object = K::default();
            object.meta_mut().name = Some(name.to_string());
            object.meta_mut().namespace = objects.namespace().map(str::to_string);
            mutate(&mut object)?;
            let created = objects.create(&object).await?;
            Ok((OperationResult::Created, created))
        }
        Some(current) => {
            let mut object = current.clone();
            mutate(&mut object)?;
            if unchanged(&current, &object)? {
                return Ok((OperationResult::None, current));
            }
            let updated = objects.replace(&object).await?;
            Ok((OperationResult::Updated, updated))
        }
    }
}

/// Mutate an existing object. Returns `None` when it is absent.
pub async fn update<K, F>(objects: &Objects<K>, name: &str, mut mutate: F) -> Result<Option<(OperationResult, K)>>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
    F: FnMut(&mut K) -> Result<()> + Send,
{
    let mut schedule = ConflictBackoff::default();
    loop {
        match try_update(objects, name, &mut mutate).await {
            Err(err) => backoff_on_conflict(&mut schedule, err, objects.kind(), name).await?,
            done => return done,
        }
    }
}

async fn try_update<K, F>(objects: &Objects<K>, name: &str, mutate: &mut F) -> Result<Option<(OperationResult, K)>>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
    F: FnMut(&mut K) -> Result<()> + Send,
{
    let Some(current) = objects.get(name).await? else {
        return Ok(None);
    };
    let mut object = current.clone();
    mutate(&mut object)?;
    if unchanged(&current, &object)? {
        return Ok(Some((OperationResult::None, current)));
    }
    let updated = objects.replace(&object).await?;
    Ok(Some((OperationResult::Updated, updated)))
}

/// Mutate the status of an existing object through the status endpoint.
/// Returns whether a write happened.
pub async fn update_status<K, F>(objects: &Objects<K>, name: &str, mut mutate: F) -> Result<bool>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
    F: FnMut(&mut K) + Send,
{
    let mut schedule = ConflictBackoff::default();
    loop {
        match try_update_status(objects, name, &mut mutate).await {
            Err(err) => backoff_on_conflict(&mut schedule, err, objects.kind(), name).await?,
            done => return done,
        }
    }
}

async fn try_update_status<K, F>(objects: &Objects<K>, name: &str, mutate: &mut F) -> Result<bool>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
    F: FnMut(&mut K) + Send,
{
    let current = objects.get_required(name).await?;
    let mut object = current.clone();
    mutate(&mut object);
    if unchanged(&current, &object)? {
        return Ok(false);
    }
    objects.replace_status(&object).await?;
    Ok(true)
}
