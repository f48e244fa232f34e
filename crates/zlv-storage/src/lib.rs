//! Persistence sink contract for the import pipeline, plus retry/timeout
//! wrapping and the in-memory and Postgres implementations.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;
use zlv_core::{
    BuildingRecord, HousingOwnerConflict, HousingOwnerLink, HousingRecord, OwnerConflict,
    OwnerIdentity, OwnerPatch,
};

mod postgres;

pub use postgres::PgSink;

pub const CRATE_NAME: &str = "zlv-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("transient sink failure: {0}")]
    Transient(String),
    #[error("permanent sink failure: {0}")]
    Permanent(String),
    #[error("sink call `{0}` timed out")]
    Timeout(&'static str),
    #[error("owner {0} not found")]
    OwnerNotFound(Uuid),
}

impl SinkError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            SinkError::Transient(_) | SinkError::Timeout(_) => RetryDisposition::Retryable,
            SinkError::Permanent(_) | SinkError::OwnerNotFound(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Narrow upsert interface the pipeline writes through. Every write is
/// idempotent: owners by id, links by (owner, housing), housing by
/// (geo_code, local_id), buildings by id.
#[async_trait]
pub trait OwnerSink: Send + Sync {
    async fn get_owner(&self, id: Uuid) -> Result<Option<OwnerIdentity>, SinkError>;

    async fn get_owner_by_external_id(
        &self,
        idpersonne: &str,
    ) -> Result<Option<OwnerIdentity>, SinkError>;

    /// Owners sharing a blocking key, ordered by id.
    async fn find_owners_by_blocking_key(
        &self,
        blocking_key: &str,
    ) -> Result<Vec<OwnerIdentity>, SinkError>;

    async fn create_owner(&self, owner: &OwnerIdentity) -> Result<(), SinkError>;

    async fn update_owner(&self, id: Uuid, patch: &OwnerPatch)
        -> Result<OwnerIdentity, SinkError>;

    async fn create_owner_conflict(&self, conflict: &OwnerConflict) -> Result<(), SinkError>;

    async fn get_housing_owner_link(
        &self,
        owner_id: Uuid,
        geo_code: &str,
        local_id: &str,
    ) -> Result<Option<HousingOwnerLink>, SinkError>;

    async fn create_housing_owner_link(&self, link: &HousingOwnerLink) -> Result<(), SinkError>;

    async fn update_housing_owner_link(&self, link: &HousingOwnerLink) -> Result<(), SinkError>;

    async fn create_housing_owner_conflict(
        &self,
        conflict: &HousingOwnerConflict,
    ) -> Result<(), SinkError>;

    async fn upsert_housing(&self, housing: &HousingRecord) -> Result<(), SinkError>;

    async fn upsert_building(&self, building: &BuildingRecord) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Wraps a sink with a per-call timeout and bounded exponential retries of
/// transient failures.
#[derive(Clone)]
pub struct RetryingSink {
    inner: Arc<dyn OwnerSink>,
    backoff: BackoffPolicy,
    timeout: Duration,
}

impl RetryingSink {
    pub fn new(inner: Arc<dyn OwnerSink>, backoff: BackoffPolicy, timeout: Duration) -> Self {
        Self {
            inner,
            backoff,
            timeout,
        }
    }

    async fn call<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, SinkError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, SinkError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout(op)),
            };
            match result {
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(op, attempt, ?delay, error = %err, "retrying sink call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl OwnerSink for RetryingSink {
    async fn get_owner(&self, id: Uuid) -> Result<Option<OwnerIdentity>, SinkError> {
        self.call("get_owner", || self.inner.get_owner(id)).await
    }

    async fn get_owner_by_external_id(
        &self,
        idpersonne: &str,
    ) -> Result<Option<OwnerIdentity>, SinkError> {
        self.call("get_owner_by_external_id", || {
            self.inner.get_owner_by_external_id(idpersonne)
        })
        .await
    }

    async fn find_owners_by_blocking_key(
        &self,
        blocking_key: &str,
    ) -> Result<Vec<OwnerIdentity>, SinkError> {
        self.call("find_owners_by_blocking_key", || {
            self.inner.find_owners_by_blocking_key(blocking_key)
        })
        .await
    }

    async fn create_owner(&self, owner: &OwnerIdentity) -> Result<(), SinkError> {
        self.call("create_owner", || self.inner.create_owner(owner))
            .await
    }

    async fn update_owner(
        &self,
        id: Uuid,
        patch: &OwnerPatch,
    ) -> Result<OwnerIdentity, SinkError> {
        self.call("update_owner", || self.inner.update_owner(id, patch))
            .await
    }

    async fn create_owner_conflict(&self, conflict: &OwnerConflict) -> Result<(), SinkError> {
        self.call("create_owner_conflict", || {
            self.inner.create_owner_conflict(conflict)
        })
        .await
    }

    async fn get_housing_owner_link(
        &self,
        owner_id: Uuid,
        geo_code: &str,
        local_id: &str,
    ) -> Result<Option<HousingOwnerLink>, SinkError> {
        self.call("get_housing_owner_link", || {
            self.inner.get_housing_owner_link(owner_id, geo_code, local_id)
        })
        .await
    }

    async fn create_housing_owner_link(&self, link: &HousingOwnerLink) -> Result<(), SinkError> {
        self.call("create_housing_owner_link", || {
            self.inner.create_housing_owner_link(link)
        })
        .await
    }

    async fn update_housing_owner_link(&self, link: &HousingOwnerLink) -> Result<(), SinkError> {
        self.call("update_housing_owner_link", || {
            self.inner.update_housing_owner_link(link)
        })
        .await
    }

    async fn create_housing_owner_conflict(
        &self,
        conflict: &HousingOwnerConflict,
    ) -> Result<(), SinkError> {
        self.call("create_housing_owner_conflict", || {
            self.inner.create_housing_owner_conflict(conflict)
        })
        .await
    }

    async fn upsert_housing(&self, housing: &HousingRecord) -> Result<(), SinkError> {
        self.call("upsert_housing", || self.inner.upsert_housing(housing))
            .await
    }

    async fn upsert_building(&self, building: &BuildingRecord) -> Result<(), SinkError> {
        self.call("upsert_building", || self.inner.upsert_building(building))
            .await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    owners: BTreeMap<Uuid, OwnerIdentity>,
    by_idpersonne: HashMap<String, Uuid>,
    by_blocking_key: HashMap<String, BTreeSet<Uuid>>,
    owner_conflicts: Vec<OwnerConflict>,
    links: BTreeMap<(Uuid, String, String), HousingOwnerLink>,
    housing_owner_conflicts: Vec<HousingOwnerConflict>,
    housing: BTreeMap<(String, String), HousingRecord>,
    buildings: BTreeMap<String, BuildingRecord>,
}

impl MemoryState {
    fn index_owner(&mut self, owner: &OwnerIdentity) {
        if let Some(id) = &owner.idpersonne {
            self.by_idpersonne.insert(id.clone(), owner.id);
        }
        if let Some(key) = &owner.blocking_key {
            self.by_blocking_key
                .entry(key.clone())
                .or_default()
                .insert(owner.id);
        }
    }

    fn unindex_owner(&mut self, owner: &OwnerIdentity) {
        if let Some(key) = &owner.blocking_key {
            if let Some(ids) = self.by_blocking_key.get_mut(key) {
                ids.remove(&owner.id);
            }
        }
    }
}

/// Serializable view of everything a [`MemorySink`] holds.
#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub owners: Vec<OwnerIdentity>,
    pub owner_conflicts: Vec<OwnerConflict>,
    pub housing_owners: Vec<HousingOwnerLink>,
    pub housing_owner_conflicts: Vec<HousingOwnerConflict>,
    pub housing: Vec<HousingRecord>,
    pub buildings: Vec<BuildingRecord>,
}

/// In-process sink used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn owners(&self) -> Vec<OwnerIdentity> {
        self.state.lock().await.owners.values().cloned().collect()
    }

    pub async fn owner_conflicts(&self) -> Vec<OwnerConflict> {
        self.state.lock().await.owner_conflicts.clone()
    }

    pub async fn housing_owner_links(&self) -> Vec<HousingOwnerLink> {
        self.state.lock().await.links.values().cloned().collect()
    }

    pub async fn housing_owner_conflicts(&self) -> Vec<HousingOwnerConflict> {
        self.state.lock().await.housing_owner_conflicts.clone()
    }

    pub async fn snapshot(&self) -> MemorySnapshot {
        let state = self.state.lock().await;
        MemorySnapshot {
            owners: state.owners.values().cloned().collect(),
            owner_conflicts: state.owner_conflicts.clone(),
            housing_owners: state.links.values().cloned().collect(),
            housing_owner_conflicts: state.housing_owner_conflicts.clone(),
            housing: state.housing.values().cloned().collect(),
            buildings: state.buildings.values().cloned().collect(),
        }
    }

    /// Write the snapshot as JSON through a temp file and an atomic rename.
    pub async fn write_snapshot(&self, path: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
        let path = path.as_ref().to_path_buf();
        let bytes = serde_json::to_vec_pretty(&self.snapshot().await)
            .context("serializing sink snapshot")?;

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(path)
    }
}

#[async_trait]
impl OwnerSink for MemorySink {
    async fn get_owner(&self, id: Uuid) -> Result<Option<OwnerIdentity>, SinkError> {
        Ok(self.state.lock().await.owners.get(&id).cloned())
    }

    async fn get_owner_by_external_id(
        &self,
        idpersonne: &str,
    ) -> Result<Option<OwnerIdentity>, SinkError> {
        let state = self.state.lock().await;
        Ok(state
            .by_idpersonne
            .get(idpersonne)
            .and_then(|id| state.owners.get(id))
            .cloned())
    }

    async fn find_owners_by_blocking_key(
        &self,
        blocking_key: &str,
    ) -> Result<Vec<OwnerIdentity>, SinkError> {
        let state = self.state.lock().await;
        Ok(state
            .by_blocking_key
            .get(blocking_key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.owners.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_owner(&self, owner: &OwnerIdentity) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        if let Some(id) = &owner.idpersonne {
            if let Some(holder) = state.by_idpersonne.get(id) {
                if *holder != owner.id {
                    return Err(SinkError::Permanent(format!(
                        "idpersonne {id} already belongs to owner {holder}"
                    )));
                }
            }
        }
        if let Some(previous) = state.owners.remove(&owner.id) {
            state.unindex_owner(&previous);
        }
        state.index_owner(owner);
        state.owners.insert(owner.id, owner.clone());
        Ok(())
    }

    async fn update_owner(
        &self,
        id: Uuid,
        patch: &OwnerPatch,
    ) -> Result<OwnerIdentity, SinkError> {
        let mut state = self.state.lock().await;
        let mut owner = state
            .owners
            .get(&id)
            .cloned()
            .ok_or(SinkError::OwnerNotFound(id))?;
        state.unindex_owner(&owner);
        owner.apply(patch, Utc::now());
        state.index_owner(&owner);
        state.owners.insert(id, owner.clone());
        Ok(owner)
    }

    async fn create_owner_conflict(&self, conflict: &OwnerConflict) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        if !state.owner_conflicts.iter().any(|c| c.id == conflict.id) {
            state.owner_conflicts.push(conflict.clone());
        }
        Ok(())
    }

    async fn get_housing_owner_link(
        &self,
        owner_id: Uuid,
        geo_code: &str,
        local_id: &str,
    ) -> Result<Option<HousingOwnerLink>, SinkError> {
        let state = self.state.lock().await;
        Ok(state
            .links
            .get(&(owner_id, geo_code.to_string(), local_id.to_string()))
            .cloned())
    }

    async fn create_housing_owner_link(&self, link: &HousingOwnerLink) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        state
            .links
            .entry((link.owner_id, link.geo_code.clone(), link.local_id.clone()))
            .or_insert_with(|| link.clone());
        Ok(())
    }

    async fn update_housing_owner_link(&self, link: &HousingOwnerLink) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        state.links.insert(
            (link.owner_id, link.geo_code.clone(), link.local_id.clone()),
            link.clone(),
        );
        Ok(())
    }

    async fn create_housing_owner_conflict(
        &self,
        conflict: &HousingOwnerConflict,
    ) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        if !state
            .housing_owner_conflicts
            .iter()
            .any(|c| c.id == conflict.id)
        {
            state.housing_owner_conflicts.push(conflict.clone());
        }
        Ok(())
    }

    async fn upsert_housing(&self, housing: &HousingRecord) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        state.housing.insert(
            (housing.geo_code.clone(), housing.local_id.clone()),
            housing.clone(),
        );
        Ok(())
    }

    async fn upsert_building(&self, building: &BuildingRecord) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        state
            .buildings
            .insert(building.building_id.clone(), building.clone());
        Ok(())
    }
}
