use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;
use zlv_core::{OwnerIdentity, OwnerRecord};
use zlv_storage::{OwnerSink, SinkError};

use crate::cache::ComparisonCache;
use crate::config::MatchPolicy;
use crate::conflict::ConflictDetector;
use crate::similarity::{blocking_key, SimilarityPolicy};

/// Run-scoped mutexes keyed by string. Callers take every key they need in
/// one call; keys are locked in sorted order so overlapping sets never
/// deadlock. An entry lives only while someone holds or waits on it.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Releases its key on drop and forgets the key once nobody else wants it.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl KeyedLocks {
    pub async fn acquire(&self, keys: &[String]) -> Vec<KeyGuard> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let mutex = self.locks.entry(key.clone()).or_default().clone();
            let guard = mutex.lock_owned().await;
            guards.push(KeyGuard {
                key,
                guard: Some(guard),
                locks: Arc::clone(&self.locks),
            });
        }
        guards
    }

    /// Keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Created,
    Merged { conflict: bool },
    /// Matched an identity that already carried everything the record had.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResolution {
    pub owner_id: Uuid,
    pub outcome: MatchOutcome,
    pub blocking_key: Option<String>,
}

/// Assigns incoming owner records to persisted identities.
pub struct OwnerMatcher {
    sink: Arc<dyn OwnerSink>,
    cache: Arc<ComparisonCache>,
    similarity: Arc<dyn SimilarityPolicy>,
    detector: ConflictDetector,
    threshold: f64,
    locks: KeyedLocks,
    // taken last and alone, after the key locks
    identity_locks: KeyedLocks,
}

impl OwnerMatcher {
    pub fn new(
        sink: Arc<dyn OwnerSink>,
        cache: Arc<ComparisonCache>,
        similarity: Arc<dyn SimilarityPolicy>,
        policy: &MatchPolicy,
    ) -> Self {
        Self {
            sink,
            cache,
            similarity,
            detector: ConflictDetector::new(policy.field_priority),
            threshold: policy.match_threshold,
            locks: KeyedLocks::default(),
            identity_locks: KeyedLocks::default(),
        }
    }

    pub fn cache(&self) -> &ComparisonCache {
        &self.cache
    }

    /// Keys serializing work on `record`: its bucket and its external id.
    /// Records with neither lock on their own surrogate id.
    pub fn lock_keys(record: &OwnerRecord) -> Vec<String> {
        let mut keys = Vec::with_capacity(2);
        if let Some(key) = blocking_key(record) {
            keys.push(format!("bucket:{key}"));
        }
        if let Some(id) = &record.idpersonne {
            keys.push(format!("idpersonne:{id}"));
        }
        if keys.is_empty() {
            keys.push(format!("owner:{}", record.surrogate_id()));
        }
        keys
    }

    pub async fn resolve(&self, record: &OwnerRecord) -> Result<MatchResolution, SinkError> {
        let key = blocking_key(record);
        let _guards = self.locks.acquire(&Self::lock_keys(record)).await;
        let incoming_id = record.surrogate_id();

        let target = self.find_target(record, key.as_deref(), incoming_id).await?;
        let identity_id = target.unwrap_or(incoming_id);

        // Two records holding disjoint key sets can still land on one
        // identity; the identity lock and a fresh read serialize them.
        let _identity = self
            .identity_locks
            .acquire(&[identity_id.to_string()])
            .await;
        let now = Utc::now();
        if let Some(existing) = self.sink.get_owner(identity_id).await? {
            return self.merge(existing, record, key, now).await;
        }

        let identity = OwnerIdentity::from_record(record, key.clone(), now);
        self.sink.create_owner(&identity).await?;
        debug!(owner_id = %identity.id, bucket = ?key, "new owner identity");
        Ok(MatchResolution {
            owner_id: identity.id,
            outcome: MatchOutcome::Created,
            blocking_key: key,
        })
    }

    /// Identity the record belongs to: exact external id, then its own
    /// surrogate, then the best similar owner of its bucket.
    async fn find_target(
        &self,
        record: &OwnerRecord,
        bucket: Option<&str>,
        incoming_id: Uuid,
    ) -> Result<Option<Uuid>, SinkError> {
        if let Some(idpersonne) = &record.idpersonne {
            if let Some(existing) = self.sink.get_owner_by_external_id(idpersonne).await? {
                debug!(%idpersonne, owner_id = %existing.id, "exact external id match");
                return Ok(Some(existing.id));
            }
        }

        if let Some(same) = self.sink.get_owner(incoming_id).await? {
            debug!(owner_id = %same.id, "record already has an identity");
            return Ok(Some(same.id));
        }

        let Some(bucket) = bucket else {
            return Ok(None);
        };
        let mut candidates = self.sink.find_owners_by_blocking_key(bucket).await?;
        candidates.sort_by_key(|c| c.id);

        let mut best: Option<(f64, Uuid)> = None;
        for candidate in &candidates {
            if let (Some(a), Some(b)) = (&record.idpersonne, &candidate.idpersonne) {
                if a != b {
                    continue;
                }
            }
            let score = self.cache.get_or_insert_with(incoming_id, candidate.id, || {
                self.similarity.score(record, candidate)
            });
            // strict comparison keeps the lowest id on ties
            if score >= self.threshold && best.map_or(true, |(top, _)| score > top) {
                best = Some((score, candidate.id));
            }
        }
        if let Some((score, owner_id)) = best {
            debug!(bucket = %bucket, score, %owner_id, "similarity match");
        }
        Ok(best.map(|(_, owner_id)| owner_id))
    }

    async fn merge(
        &self,
        existing: OwnerIdentity,
        record: &OwnerRecord,
        key: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<MatchResolution, SinkError> {
        let merge = self.detector.merge_owner(&existing, record, now);
        // conflict first so the replaced value is on record before any update
        if let Some(conflict) = &merge.conflict {
            self.sink.create_owner_conflict(conflict).await?;
        }
        if !merge.patch.is_empty() {
            self.sink.update_owner(existing.id, &merge.patch).await?;
        }
        let outcome = if merge.conflict.is_some() || !merge.patch.is_empty() {
            MatchOutcome::Merged {
                conflict: merge.conflict.is_some(),
            }
        } else {
            MatchOutcome::Unchanged
        };
        Ok(MatchResolution {
            owner_id: existing.id,
            outcome,
            blocking_key: key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::WeightedSimilarity;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use zlv_storage::MemorySink;

    struct CountingPolicy {
        calls: AtomicUsize,
        score: f64,
    }

    impl SimilarityPolicy for CountingPolicy {
        fn score(&self, _incoming: &OwnerRecord, _candidate: &OwnerIdentity) -> f64 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.score
        }
    }

    fn record(idpersonne: Option<&str>, name: &str, address: &[&str]) -> OwnerRecord {
        OwnerRecord {
            idpersonne: idpersonne.map(ToString::to_string),
            full_name: name.into(),
            raw_address: address.iter().map(|s| s.to_string()).collect(),
            birth_date: None,
            kind: None,
            siren: None,
            data_source: None,
        }
    }

    async fn seed(sink: &MemorySink, id: u128, rec: &OwnerRecord) -> OwnerIdentity {
        let mut identity = OwnerIdentity::from_record(rec, blocking_key(rec), Utc::now());
        identity.id = Uuid::from_u128(id);
        sink.create_owner(&identity).await.expect("seed");
        identity
    }

    fn matcher(sink: Arc<MemorySink>, similarity: Arc<dyn SimilarityPolicy>) -> OwnerMatcher {
        OwnerMatcher::new(
            sink,
            Arc::new(ComparisonCache::new()),
            similarity,
            &MatchPolicy::default(),
        )
    }

    const BOURG: [&str; 2] = ["1 rue A", "01000 BOURG"];

    #[tokio::test]
    async fn cached_pairs_are_not_rescored() {
        let sink = Arc::new(MemorySink::new());
        let a = seed(&sink, 1, &record(None, "DUPONT JEAN", &BOURG)).await;
        seed(&sink, 2, &record(None, "DUPONT PAUL", &BOURG)).await;
        let policy = Arc::new(CountingPolicy {
            calls: AtomicUsize::new(0),
            score: 0.0,
        });
        let matcher = matcher(sink.clone(), policy.clone());
        let incoming = record(None, "DUPONT JEANNE", &BOURG);

        matcher.cache().add(a.id, incoming.surrogate_id(), 0.1);
        let resolution = matcher.resolve(&incoming).await.expect("resolve");
        assert_eq!(resolution.outcome, MatchOutcome::Created);
        assert_eq!(policy.calls.load(Ordering::SeqCst), 1);
        assert!(matcher.cache().has(Uuid::from_u128(2), incoming.surrogate_id()));
        assert_eq!(matcher.cache().len(), 2);
    }

    #[tokio::test]
    async fn similar_record_merges_into_existing_identity() {
        let sink = Arc::new(MemorySink::new());
        let existing = seed(&sink, 1, &record(None, "DUPONT JEAN", &BOURG)).await;
        let matcher = matcher(sink.clone(), Arc::new(WeightedSimilarity::default()));

        let mut incoming = record(Some("01000001"), "Dupont, Jean", &["1 RUE A", "01000 Bourg"]);
        incoming.kind = Some(zlv_core::OwnerKind::Natural);
        let resolution = matcher.resolve(&incoming).await.expect("resolve");
        assert_eq!(resolution.owner_id, existing.id);
        assert_eq!(resolution.outcome, MatchOutcome::Merged { conflict: false });

        let owners = sink.owners().await;
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].idpersonne.as_deref(), Some("01000001"));
        assert_eq!(owners[0].kind, Some(zlv_core::OwnerKind::Natural));
    }

    #[tokio::test]
    async fn ties_resolve_to_lowest_id() {
        let sink = Arc::new(MemorySink::new());
        seed(&sink, 9, &record(None, "DUPONT JEAN", &BOURG)).await;
        seed(&sink, 3, &record(None, "DUPONT JEAN", &BOURG)).await;
        let policy = Arc::new(CountingPolicy {
            calls: AtomicUsize::new(0),
            score: 1.0,
        });
        let matcher = matcher(sink, policy);
        let resolution = matcher
            .resolve(&record(None, "DUPONT JEAN", &["2 rue A", "01000 BOURG"]))
            .await
            .expect("resolve");
        assert_eq!(resolution.owner_id, Uuid::from_u128(3));
    }

    #[tokio::test]
    async fn different_external_ids_never_merge() {
        let sink = Arc::new(MemorySink::new());
        seed(&sink, 1, &record(Some("01000001"), "DUPONT JEAN", &BOURG)).await;
        let policy = Arc::new(CountingPolicy {
            calls: AtomicUsize::new(0),
            score: 1.0,
        });
        let matcher = matcher(sink.clone(), policy.clone());
        let resolution = matcher
            .resolve(&record(Some("01000002"), "DUPONT JEAN", &BOURG))
            .await
            .expect("resolve");
        assert_eq!(resolution.outcome, MatchOutcome::Created);
        assert_eq!(policy.calls.load(Ordering::SeqCst), 0);
        assert_eq!(sink.owners().await.len(), 2);
    }

    #[tokio::test]
    async fn replays_reproduce_the_same_partition() {
        let sink = Arc::new(MemorySink::new());
        let records = vec![
            record(Some("01000001"), "DUPONT JEAN", &BOURG),
            record(None, "DUPONT JEAN", &["1 rue A", "01000 Bourg"]),
            record(None, "MARTIN ANNE", &["5 rue C", "01000 BOURG"]),
            record(None, "NOADDRESS", &[]),
        ];
        let first = matcher(sink.clone(), Arc::new(WeightedSimilarity::default()));
        let mut partition = Vec::new();
        for rec in &records {
            partition.push(first.resolve(rec).await.expect("resolve").owner_id);
        }
        let owners_after_first = sink.owners().await;
        assert_eq!(owners_after_first.len(), 3);
        assert_eq!(partition[0], partition[1]);

        let second = matcher(sink.clone(), Arc::new(WeightedSimilarity::default()));
        for (rec, expected) in records.iter().zip(&partition) {
            let resolution = second.resolve(rec).await.expect("resolve");
            assert_eq!(&resolution.owner_id, expected);
        }
        let ids = |owners: Vec<OwnerIdentity>| owners.into_iter().map(|o| o.id).collect::<Vec<_>>();
        assert_eq!(ids(sink.owners().await), ids(owners_after_first));
    }

    #[tokio::test]
    async fn unbucketable_record_still_gets_an_identity() {
        let sink = Arc::new(MemorySink::new());
        let matcher = matcher(sink.clone(), Arc::new(WeightedSimilarity::default()));
        let resolution = matcher
            .resolve(&record(None, "SCI DES LILAS", &[]))
            .await
            .expect("resolve");
        assert_eq!(resolution.outcome, MatchOutcome::Created);
        assert_eq!(resolution.blocking_key, None);
        assert_eq!(sink.owners().await.len(), 1);
    }

    #[tokio::test]
    async fn overlapping_lock_sets_do_not_deadlock() {
        let locks = Arc::new(KeyedLocks::default());
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let locks = locks.clone();
            tasks.spawn(async move {
                let keys = if i % 2 == 0 {
                    vec!["a".to_string(), "b".to_string()]
                } else {
                    vec!["b".to_string(), "a".to_string(), "a".to_string()]
                };
                let guards = locks.acquire(&keys).await;
                assert_eq!(guards.len(), 2);
                tokio::task::yield_now().await;
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.expect("task");
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn released_keys_are_forgotten() {
        let locks = KeyedLocks::default();
        for i in 0..100 {
            let guards = locks.acquire(&[format!("bucket:{i}"), "shared".to_string()]).await;
            assert_eq!(locks.len(), 2);
            drop(guards);
        }
        assert!(locks.is_empty());
    }

    fn prefer_incoming(sink: Arc<MemorySink>) -> OwnerMatcher {
        OwnerMatcher::new(
            sink,
            Arc::new(ComparisonCache::new()),
            Arc::new(WeightedSimilarity::default()),
            &MatchPolicy {
                field_priority: crate::conflict::FieldPriority::PreferIncoming,
                ..MatchPolicy::default()
            },
        )
    }

    #[tokio::test]
    async fn unbucketable_twin_with_other_siren_is_a_conflict() {
        let sink = Arc::new(MemorySink::new());
        let matcher = matcher(sink.clone(), Arc::new(WeightedSimilarity::default()));
        let mut first = record(None, "SCI DES LILAS", &[]);
        first.siren = Some("123456789".into());
        let mut second = record(None, "SCI des Lilas", &[]);
        second.siren = Some("987654321".into());

        let created = matcher.resolve(&first).await.expect("resolve");
        assert_eq!(created.outcome, MatchOutcome::Created);
        let merged = matcher.resolve(&second).await.expect("resolve");
        assert_eq!(merged.owner_id, created.owner_id);
        assert_eq!(merged.outcome, MatchOutcome::Merged { conflict: true });

        let owners = sink.owners().await;
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].siren.as_deref(), Some("123456789"));
        let conflicts = sink.owner_conflicts().await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].fields, vec!["siren".to_string()]);

        let replay = matcher.resolve(&first).await.expect("resolve");
        assert_eq!(replay.outcome, MatchOutcome::Unchanged);
    }

    #[tokio::test]
    async fn preferred_new_address_is_found_under_its_new_bucket() {
        let sink = Arc::new(MemorySink::new());
        let matcher = prefer_incoming(sink.clone());
        matcher
            .resolve(&record(Some("01234567"), "DUPONT JEAN", &BOURG))
            .await
            .expect("resolve");
        let paris = ["1 rue A", "75002 PARIS"];
        let moved = matcher
            .resolve(&record(Some("01234567"), "DUPONT JEAN", &paris))
            .await
            .expect("resolve");
        assert_eq!(moved.outcome, MatchOutcome::Merged { conflict: true });

        let stored = sink.owners().await.remove(0);
        assert_eq!(stored.blocking_key, blocking_key(&record(None, "DUPONT JEAN", &paris)));

        let plain = matcher
            .resolve(&record(None, "DUPONT JEAN", &paris))
            .await
            .expect("resolve");
        assert_eq!(plain.owner_id, stored.id);
        assert_eq!(plain.outcome, MatchOutcome::Unchanged);
        assert_eq!(sink.owners().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_paths_to_one_identity_keep_both_updates() {
        let sink = Arc::new(MemorySink::new());
        let matcher = Arc::new(prefer_incoming(sink.clone()));
        let seeded = matcher
            .resolve(&record(Some("01234567"), "DUPONT JEAN", &BOURG))
            .await
            .expect("resolve");

        // bucket lock only
        let mut by_bucket = record(None, "DUPONT JEAN", &BOURG);
        by_bucket.birth_date = chrono::NaiveDate::from_ymd_opt(1950, 2, 3);
        // external id lock under another bucket
        let mut by_id = record(Some("01234567"), "DUPONT JEAN", &[]);
        by_id.siren = Some("123456789".into());

        let (a, b) = tokio::join!(
            {
                let matcher = matcher.clone();
                async move { matcher.resolve(&by_bucket).await }
            },
            {
                let matcher = matcher.clone();
                async move { matcher.resolve(&by_id).await }
            }
        );
        assert_eq!(a.expect("bucket path").owner_id, seeded.owner_id);
        assert_eq!(b.expect("id path").owner_id, seeded.owner_id);

        let owners = sink.owners().await;
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].birth_date, chrono::NaiveDate::from_ymd_opt(1950, 2, 3));
        assert_eq!(owners[0].siren.as_deref(), Some("123456789"));
        assert_eq!(owners[0].raw_address, vec!["1 rue A", "01000 BOURG"]);
    }
}
