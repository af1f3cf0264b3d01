use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod backoff;
mod cluster;
mod config;
mod deletion;
mod events;
mod fetch;
mod fingerprint;
mod lsh;
mod minhash;
mod pipeline;
mod plan;
mod postgres;
mod rate_limit;
mod retention;
mod store;
mod workers;

use cluster::ClusterMode;
use config::RunCfg;
use fetch::HttpFetcher;
use fingerprint::Fingerprinter;
use pipeline::{PipelineError, RunOptions};
use postgres::PgStore;
use store::RecordStore;

/// Find near-duplicate images in the gallery and keep one record per group.
#[derive(Parser, Debug)]
#[command(name = "imgdedup", version)]
struct Cli {
    /// YAML config; missing file means defaults.
    #[arg(long, default_value = "dedupe.yaml")]
    config: PathBuf,
    /// Actually delete. Without it the run only reports what it would do.
    #[arg(long)]
    live: bool,
    #[arg(long, conflicts_with = "live")]
    dry_run: bool,
    /// Max Hamming distance between fingerprints of one cluster.
    #[arg(long)]
    hamming_threshold: Option<u32>,
    #[arg(long)]
    bands: Option<usize>,
    #[arg(long)]
    rows: Option<usize>,
    /// Target Jaccard threshold; derives bands/rows from it.
    #[arg(long, conflicts_with_all = ["bands", "rows"])]
    lsh_threshold: Option<f64>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long, value_enum)]
    cluster_mode: Option<ClusterMode>,
    /// Append the retention plan as JSONL to this file.
    #[arg(long)]
    plan_out: Option<PathBuf>,
    #[arg(long)]
    no_progress: bool,
}

impl Cli {
    fn apply(&self, cfg: &mut RunCfg) {
        if self.live { cfg.delete.dry_run = false; }
        if self.dry_run { cfg.delete.dry_run = true; }
        if let Some(t) = self.hamming_threshold { cfg.cluster.hamming_threshold = t; }
        if let Some(m) = self.cluster_mode { cfg.cluster.mode = m; }
        if let Some(c) = self.concurrency { cfg.fetch.concurrency = c; }
        if self.no_progress { cfg.fetch.progress = false; }
        if let Some(p) = &self.plan_out { cfg.plan_out = Some(p.clone()); }

        if self.bands.is_some() || self.rows.is_some() {
            cfg.index.threshold = None;
            if let Some(b) = self.bands { cfg.index.bands = b; }
            if let Some(r) = self.rows { cfg.index.rows = r; }
            cfg.index.num_perm = cfg.index.bands.saturating_mul(cfg.index.rows);
        }
        if let Some(t) = self.lsh_threshold { cfg.index.threshold = Some(t); }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = RunCfg::load(&cli.config).await?;
    cli.apply(&mut cfg);
    cfg.validate()?;

    let opts = RunOptions::from_cfg(&cfg)?;
    let fingerprinter = Fingerprinter::new(cfg.fingerprint.algorithm, cfg.fingerprint.dct);
    let fetcher = Arc::new(HttpFetcher::from_cfg(&cfg.fetch, fingerprinter)?);

    if opts.dry_run {
        tracing::info!("dry run: no records will be deleted (pass --live to delete)");
    } else {
        tracing::warn!("live run: duplicate records will be deleted");
    }

    let store = PgStore::connect(&cfg.database).await?;
    let result = pipeline::run(&store, fetcher, &opts).await;
    store.close().await;

    match result {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(PipelineError::EmptySource) => {
            tracing::warn!("no (id, url) pairs found, nothing to do");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
