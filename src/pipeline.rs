use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::cluster::{build_clusters, build_index, Cluster, ClusterMode};
use crate::config::RunCfg;
use crate::deletion::{self, DeletionOutcome};
use crate::events::{RunPhase, RunState};
use crate::fetch::ImageFetcher;
use crate::fingerprint::Fingerprint;
use crate::lsh::{IndexError, LshParams};
use crate::minhash::MinHasher;
use crate::rate_limit::Throttle;
use crate::retention::resolve_all;
use crate::store::{RecordStore, StoreError};
use crate::workers::fingerprint_all;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("record source returned no records")]
    EmptySource,
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("failed to write plan: {0:#}")]
    Plan(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dry_run: bool,
    pub hamming_threshold: u32,
    pub lsh: LshParams,
    pub concurrency: usize,
    pub cluster_mode: ClusterMode,
    pub minhash_seed: u64,
    pub delete_delay_ms: u64,
    pub plan_out: Option<PathBuf>,
    pub progress: bool,
}

impl RunOptions {
    pub fn new(
        dry_run: bool,
        hamming_threshold: u32,
        lsh_bands: usize,
        lsh_rows: usize,
        concurrency: usize,
    ) -> Result<Self, IndexError> {
        Ok(Self {
            dry_run,
            hamming_threshold,
            lsh: LshParams::new(lsh_bands, lsh_rows)?,
            concurrency: concurrency.max(1),
            cluster_mode: ClusterMode::default(),
            minhash_seed: 42,
            delete_delay_ms: 0,
            plan_out: None,
            progress: false,
        })
    }

    pub fn from_cfg(cfg: &RunCfg) -> Result<Self, IndexError> {
        let lsh = match cfg.index.threshold {
            Some(t) => LshParams::for_threshold(cfg.index.num_perm, t)?,
            None => LshParams::new(cfg.index.bands, cfg.index.rows)?,
        };
        Ok(Self {
            dry_run: cfg.delete.dry_run,
            hamming_threshold: cfg.cluster.hamming_threshold,
            lsh,
            concurrency: cfg.fetch.concurrency.max(1),
            cluster_mode: cfg.cluster.mode,
            minhash_seed: cfg.index.seed,
            delete_delay_ms: cfg.delete.delay_ms,
            plan_out: cfg.plan_out.clone(),
            progress: cfg.fetch.progress,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub run_id: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: u64,
    pub fingerprinted: u64,
    pub errors_by_reason: BTreeMap<String, u64>,
    pub unique_images: u64,
    pub clusters_found: u64,
    pub marked_for_deletion: u64,
    pub attempted: u64,
    pub deleted: u64,
    pub delete_failed: u64,
    pub already_absent: u64,
    pub failed_ids: Vec<i64>,
    pub delete_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_path: Option<PathBuf>,
}

fn abort<E: Into<PipelineError>>(state: &mut RunState, e: E) -> PipelineError {
    let e = e.into();
    tracing::error!(error = %e, "run aborted before any deletion");
    state.advance(RunPhase::Aborted);
    e
}

/// Index and cluster phases. An index error moves the run to `Aborted`.
fn index_and_cluster(
    state: &mut RunState,
    fingerprints: &BTreeMap<i64, Fingerprint>,
    hasher: &MinHasher,
    opts: &RunOptions,
) -> Result<Vec<Cluster>, PipelineError> {
    state.advance(RunPhase::Indexing);
    let index = build_index(opts.lsh, hasher, fingerprints).map_err(|e| abort(state, e))?;
    if index.is_empty() {
        tracing::warn!("no image could be fingerprinted, nothing to compare");
    }
    tracing::info!(
        indexed = index.len(),
        bands = opts.lsh.bands,
        rows = opts.lsh.rows,
        jaccard_threshold = opts.lsh.threshold(),
        recall_at_0_9 = opts.lsh.candidate_probability(0.9),
        "index built"
    );

    state.advance(RunPhase::Clustering);
    let clusters = build_clusters(fingerprints, hasher, &index, opts.hamming_threshold, opts.cluster_mode)
        .map_err(|e| abort(state, e))?;
    tracing::info!(
        clusters = clusters.len(),
        duplicate_clusters = clusters.iter().filter(|c| c.is_duplicate()).count(),
        mode = ?opts.cluster_mode,
        "clustering done"
    );
    Ok(clusters)
}

/// One full reconciliation pass. Phases run strictly one after another; only
/// fetching is concurrent. Anything fatal is raised before the first delete.
pub async fn run(
    store: &dyn RecordStore,
    fetcher: Arc<dyn ImageFetcher>,
    opts: &RunOptions,
) -> Result<Report, PipelineError> {
    let run_id = format!("dedupe-{}", Uuid::new_v4());
    let started_at = Utc::now();
    let mut state = RunState::new(&run_id);
    tracing::info!(%run_id, dry_run = opts.dry_run, fetcher = fetcher.name(), "starting run");

    // Source + fetch
    state.advance(RunPhase::Fetching);
    let mut records = store.fetch_records().await.map_err(|e| abort(&mut state, e))?;
    records.sort_by_key(|r| r.id);
    records.dedup_by_key(|r| r.id);
    if records.is_empty() {
        return Err(abort(&mut state, PipelineError::EmptySource));
    }
    tracing::info!(records = records.len(), concurrency = opts.concurrency, "fetching images");
    let fetched = fingerprint_all(&records, fetcher, opts.concurrency, opts.progress).await;

    let hasher = MinHasher::new(opts.lsh.num_perm(), opts.minhash_seed);
    let clusters = index_and_cluster(&mut state, &fetched.fingerprints, &hasher, opts)?;
    let duplicate_clusters = clusters.iter().filter(|c| c.is_duplicate()).count();

    // Retention
    state.advance(RunPhase::Resolving);
    let decisions = resolve_all(store, &clusters).await.map_err(|e| abort(&mut state, e))?;
    let delete_ids: Vec<i64> = decisions.iter().flat_map(|d| d.delete_ids.iter().copied()).collect();
    tracing::info!(marked = delete_ids.len(), "retention resolved");

    let plan_path = match &opts.plan_out {
        Some(path) => Some(
            crate::plan::write_plan(path, &run_id, opts.dry_run, &decisions)
                .await
                .map_err(|e| abort(&mut state, PipelineError::Plan(e)))?,
        ),
        None => None,
    };

    // Delete
    state.advance(RunPhase::Deleting);
    let outcome = if opts.dry_run {
        tracing::info!(would_delete = delete_ids.len(), "dry run, nothing deleted");
        for batch in delete_ids.chunks(20) {
            tracing::info!(ids = ?batch, "would delete");
        }
        DeletionOutcome::default()
    } else if delete_ids.is_empty() {
        tracing::info!("no duplicates to delete");
        DeletionOutcome::default()
    } else {
        let mut deleter = store.open_deleter().await.map_err(|e| abort(&mut state, e))?;
        let mut throttle = Throttle::from_millis(opts.delete_delay_ms);
        deletion::apply(deleter.as_mut(), &delete_ids, &mut throttle).await
    };

    state.advance(RunPhase::Reported);
    debug_assert!(state.phase().is_terminal());
    tracing::debug!(phases = ?state.history(), "phase history");
    let report = Report {
        run_id,
        dry_run: opts.dry_run,
        started_at,
        finished_at: Utc::now(),
        processed: fetched.processed,
        fingerprinted: fetched.fingerprints.len() as u64,
        errors_by_reason: fetched.errors_by_reason,
        unique_images: clusters.len() as u64,
        clusters_found: duplicate_clusters as u64,
        marked_for_deletion: delete_ids.len() as u64,
        attempted: outcome.attempted,
        deleted: outcome.deleted,
        delete_failed: outcome.failed,
        already_absent: outcome.already_absent,
        failed_ids: outcome.failed_ids,
        delete_ids,
        plan_path,
    };
    tracing::info!(
        processed = report.processed,
        fingerprinted = report.fingerprinted,
        clusters_found = report.clusters_found,
        marked = report.marked_for_deletion,
        deleted = report.deleted,
        failed = report.delete_failed,
        "run finished"
    );
    Ok(report)
}
