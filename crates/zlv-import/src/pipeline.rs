use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use zlv_core::{HousingOwnerLink, HousingOwnerRecord, SourceRecord, ValidatedRecord};
use zlv_sources::{SourceRepository, StreamOptions};
use zlv_storage::{OwnerSink, RetryingSink, SinkError};

use crate::cache::ComparisonCache;
use crate::config::{ImportConfig, MatchPolicy};
use crate::conflict::{ConflictDetector, LinkDecision};
use crate::matcher::{MatchOutcome, OwnerMatcher};
use crate::report::{Report, Reporter};
use crate::similarity::{blocking_key, SimilarityPolicy, WeightedSimilarity};
use crate::validate::Schema;
use crate::ImportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Passed,
    Skipped,
}

/// Read, validate and match stages joined by bounded channels.
pub struct ImportPipeline {
    config: ImportConfig,
    policy: MatchPolicy,
    sink: Arc<dyn OwnerSink>,
    similarity: Arc<dyn SimilarityPolicy>,
    cancel: Option<watch::Receiver<bool>>,
}

impl ImportPipeline {
    /// Every sink call goes through a [`RetryingSink`] built from `config`.
    pub fn new(sink: Arc<dyn OwnerSink>, config: ImportConfig) -> Self {
        let sink: Arc<dyn OwnerSink> =
            Arc::new(RetryingSink::new(sink, config.backoff, config.sink_timeout));
        let policy = MatchPolicy::default();
        Self {
            similarity: Arc::new(WeightedSimilarity::new(policy.weights)),
            policy,
            sink,
            config,
            cancel: None,
        }
    }

    /// Replaces the policy and the default similarity built from its weights.
    pub fn with_policy(mut self, policy: MatchPolicy) -> Self {
        self.similarity = Arc::new(WeightedSimilarity::new(policy.weights));
        self.policy = policy;
        self
    }

    pub fn with_similarity(mut self, similarity: Arc<dyn SimilarityPolicy>) -> Self {
        self.similarity = similarity;
        self
    }

    /// The run stops before the next chunk once the flag reads `true`.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn run(
        &self,
        source: &dyn SourceRepository,
        options: &StreamOptions,
        reporter: &Reporter,
    ) -> Result<Report, ImportError> {
        self.run_with_cache(source, options, reporter, Arc::new(ComparisonCache::new()))
            .await
    }

    /// Like [`ImportPipeline::run`] with a caller-owned comparison cache, for
    /// several sources imported within one run.
    pub async fn run_with_cache(
        &self,
        source: &dyn SourceRepository,
        options: &StreamOptions,
        reporter: &Reporter,
        cache: Arc<ComparisonCache>,
    ) -> Result<Report, ImportError> {
        let span = info_span!("import", kind = %source.kind(), location = %source.location());
        self.execute(source, options, reporter, cache)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        source: &dyn SourceRepository,
        options: &StreamOptions,
        reporter: &Reporter,
        cache: Arc<ComparisonCache>,
    ) -> Result<Report, ImportError> {
        info!(departments = ?options.departments, "import started");
        let capacity = self.config.channel_capacity.max(1);
        let chunk_size = self.config.chunk_size.max(1);

        let schema = Schema::for_kind(source.kind());
        let (tx, mut rx) = mpsc::channel(capacity);
        let stream = source.stream(options);
        let validator = tokio::spawn({
            let reporter = reporter.clone();
            let abort_early = self.config.abort_early;
            async move { schema.run_stream(stream, tx, reporter, abort_early).await }
        }
        .in_current_span());

        let worker = Arc::new(RecordWorker {
            matcher: OwnerMatcher::new(
                self.sink.clone(),
                cache.clone(),
                self.similarity.clone(),
                &self.policy,
            ),
            detector: ConflictDetector::new(self.policy.field_priority),
            sink: self.sink.clone(),
            reporter: reporter.clone(),
        });

        let mut cancel = self.cancel.clone();
        let mut chunk = Vec::with_capacity(chunk_size);
        let mut chunks = 0usize;
        loop {
            if cancel.as_ref().is_some_and(|flag| *flag.borrow()) {
                validator.abort();
                warn!(chunks, "import cancelled");
                return Err(ImportError::Cancelled);
            }
            let mut flag_dropped = false;
            let received = match cancel.as_mut() {
                Some(flag) => tokio::select! {
                    n = rx.recv_many(&mut chunk, chunk_size) => n,
                    changed = flag.changed() => {
                        flag_dropped = changed.is_err();
                        0
                    }
                },
                None => rx.recv_many(&mut chunk, chunk_size).await,
            };
            if flag_dropped {
                cancel = None;
            }
            if received == 0 {
                if rx.is_closed() && rx.is_empty() {
                    break;
                }
                continue;
            }
            worker.process_chunk(std::mem::take(&mut chunk)).await;
            chunks += 1;
        }

        let read = validator
            .await
            .map_err(|e| ImportError::Stage(e.to_string()))??;
        let report = reporter.report();
        info!(
            read,
            chunks,
            cached_pairs = cache.len(),
            passed = report.passed,
            skipped = report.skipped,
            failed = report.failed,
            "import finished"
        );
        Ok(report)
    }
}

struct RecordWorker {
    matcher: OwnerMatcher,
    detector: ConflictDetector,
    sink: Arc<dyn OwnerSink>,
    reporter: Reporter,
}

impl RecordWorker {
    /// Groups sharing a lock key run one record at a time, groups run
    /// concurrently. Returns once every record has an outcome.
    async fn process_chunk(self: &Arc<Self>, chunk: Vec<(SourceRecord, ValidatedRecord)>) {
        let mut groups: BTreeMap<String, Vec<(SourceRecord, ValidatedRecord)>> = BTreeMap::new();
        for item in chunk {
            groups.entry(group_key(&item.1)).or_default().push(item);
        }

        let mut tasks = JoinSet::new();
        for (_, group) in groups {
            let worker = Arc::clone(self);
            tasks.spawn(
                async move {
                    for (raw, record) in group {
                        worker.handle(&raw, &record).await;
                    }
                }
                .in_current_span(),
            );
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "record worker aborted");
            }
        }
    }

    async fn handle(&self, raw: &SourceRecord, record: &ValidatedRecord) {
        let result = match record {
            ValidatedRecord::Owner(owner) => {
                self.matcher.resolve(owner).await.map(|resolution| {
                    if resolution.blocking_key.is_none() {
                        self.reporter
                            .warn(raw, "no blocking key; created an unmatched owner identity");
                    }
                    match resolution.outcome {
                        MatchOutcome::Unchanged => Outcome::Skipped,
                        MatchOutcome::Created | MatchOutcome::Merged { .. } => Outcome::Passed,
                    }
                })
            }
            ValidatedRecord::Housing(housing) => {
                self.sink.upsert_housing(housing).await.map(|_| Outcome::Passed)
            }
            ValidatedRecord::Building(building) => {
                self.sink.upsert_building(building).await.map(|_| Outcome::Passed)
            }
            ValidatedRecord::HousingOwner(link) => self.link_owner(raw, link).await,
        };
        match result {
            Ok(Outcome::Passed) => self.reporter.passed(raw),
            Ok(Outcome::Skipped) => self.reporter.skipped(raw),
            Err(err) => self.reporter.failed(raw, &err),
        }
    }

    async fn link_owner(
        &self,
        raw: &SourceRecord,
        record: &HousingOwnerRecord,
    ) -> Result<Outcome, SinkError> {
        let Some(owner) = self.sink.get_owner_by_external_id(&record.idpersonne).await? else {
            self.reporter.warn(
                raw,
                &format!("owner {} is not known; link skipped", record.idpersonne),
            );
            return Ok(Outcome::Skipped);
        };
        let incoming = HousingOwnerLink {
            owner_id: owner.id,
            geo_code: record.geo_code.clone(),
            local_id: record.local_id.clone(),
            idprocpte: record.idprocpte.clone(),
            idprodroit: record.idprodroit.clone(),
            rank: record.rank,
            property_right: record.property_right,
        };
        let existing = self
            .sink
            .get_housing_owner_link(owner.id, &record.geo_code, &record.local_id)
            .await?;
        let Some(existing) = existing else {
            self.sink.create_housing_owner_link(&incoming).await?;
            return Ok(Outcome::Passed);
        };
        match self.detector.compare_link(&existing, &incoming, Utc::now()) {
            LinkDecision::Unchanged => Ok(Outcome::Skipped),
            LinkDecision::Update(link) => {
                self.sink.update_housing_owner_link(&link).await?;
                Ok(Outcome::Passed)
            }
            LinkDecision::Conflict { conflict, update } => {
                self.sink.create_housing_owner_conflict(&conflict).await?;
                if let Some(link) = update {
                    self.sink.update_housing_owner_link(&link).await?;
                }
                Ok(Outcome::Passed)
            }
        }
    }
}

fn group_key(record: &ValidatedRecord) -> String {
    match record {
        ValidatedRecord::Owner(owner) => match (blocking_key(owner), &owner.idpersonne) {
            (Some(key), _) => format!("bucket:{key}"),
            (None, Some(id)) => format!("idpersonne:{id}"),
            (None, None) => format!("owner:{}", owner.surrogate_id()),
        },
        ValidatedRecord::HousingOwner(link) => format!("idpersonne:{}", link.idpersonne),
        ValidatedRecord::Housing(housing) => {
            format!("housing:{}:{}", housing.geo_code, housing.local_id)
        }
        ValidatedRecord::Building(building) => format!("building:{}", building.building_id),
    }
}
