use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use tokio::{sync::Semaphore, task::JoinSet};

use crate::fetch::{FetchFailure, FetchOutcome, ImageFetcher};
use crate::fingerprint::Fingerprint;
use crate::store::ImageRecord;

#[derive(Debug, Default)]
pub struct FetchSummary {
    pub processed: u64,
    pub fingerprints: BTreeMap<i64, Fingerprint>,
    pub failures: BTreeMap<i64, FetchFailure>,
    pub errors_by_reason: BTreeMap<String, u64>,
}

/// Fetch and fingerprint every record with at most `concurrency` requests in
/// flight. Returns once every task has finished; each input id ends up in
/// exactly one of `fingerprints` or `failures`.
pub async fn fingerprint_all(
    records: &[ImageRecord],
    fetcher: Arc<dyn ImageFetcher>,
    concurrency: usize,
    progress: bool,
) -> FetchSummary {
    let sem = Arc::new(Semaphore::new(concurrency.clamp(1, Semaphore::MAX_PERMITS)));
    let sink: Arc<Mutex<HashMap<i64, FetchOutcome>>> = Arc::new(Mutex::new(HashMap::with_capacity(records.len())));
    let fingerprinted = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));

    let bar = if progress { ProgressBar::new(records.len() as u64) } else { ProgressBar::hidden() };
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{elapsed_precise}] {wide_bar} {pos}/{len} {msg}") {
        bar.set_style(style);
    }

    let mut joinset = JoinSet::new();

    for rec in records {
        let Ok(permit) = sem.clone().acquire_owned().await else { break };
        let fetcher = fetcher.clone();
        let sink = sink.clone();
        let fingerprinted = fingerprinted.clone();
        let failed = failed.clone();
        let bar = bar.clone();
        let rec = rec.clone();

        joinset.spawn(async move {
            let _permit = permit;
            let outcome = fetcher.fetch(&rec.url).await;
            match &outcome {
                Ok(fp) => {
                    fingerprinted.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(id = rec.id, fingerprint = %fp, "fingerprinted");
                }
                Err(f) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(id = rec.id, url = %rec.url, reason = f.reason(), "fetch failed");
                }
            }
            sink.lock().insert(rec.id, outcome);
            bar.set_message(format!("{} failed", failed.load(Ordering::Relaxed)));
            bar.inc(1);
        });
    }

    while let Some(res) = joinset.join_next().await {
        if let Err(e) = res {
            tracing::error!(error = %e, "fetch task aborted");
        }
    }
    bar.finish_and_clear();

    let mut results = std::mem::take(&mut *sink.lock());
    let mut summary = FetchSummary::default();
    for rec in records {
        summary.processed += 1;
        let outcome = results.remove(&rec.id).unwrap_or_else(|| {
            tracing::error!(id = rec.id, "no result recorded for record");
            Err(FetchFailure::DownloadError)
        });
        match outcome {
            Ok(fp) => {
                summary.fingerprints.insert(rec.id, fp);
            }
            Err(f) => {
                summary.failures.insert(rec.id, f);
                *summary.errors_by_reason.entry(f.reason().to_string()).or_default() += 1;
            }
        }
    }

    tracing::info!(
        processed = summary.processed,
        fingerprinted = fingerprinted.load(Ordering::Relaxed),
        failed = failed.load(Ordering::Relaxed),
        "fetch phase complete"
    );
    summary
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::fetch::mock::StaticFetcher;

    fn records(n: i64) -> Vec<ImageRecord> {
        (1..=n).map(|id| ImageRecord { id, url: format!("https://img.example/{id}.png") }).collect()
    }

    /// Tracks the highest number of concurrent fetches it observes.
    #[derive(Default)]
    struct Gauge {
        in_flight: AtomicU64,
        peak: AtomicU64,
    }

    #[async_trait]
    impl ImageFetcher for Gauge {
        async fn fetch(&self, url: &str) -> FetchOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if url.ends_with("3.png") { Err(FetchFailure::Timeout) } else { Ok(Fingerprint(url.len() as u64)) }
        }

        fn name(&self) -> &'static str { "gauge" }
    }

    #[tokio::test]
    async fn every_record_gets_exactly_one_outcome() {
        let fetcher = StaticFetcher::default()
            .with("https://img.example/1.png", 1)
            .with("https://img.example/2.png", 2)
            .failing("https://img.example/3.png", FetchFailure::WrongContentType)
            .failing("https://img.example/4.png", FetchFailure::ZeroBytes);
        let recs = records(5);
        let summary = fingerprint_all(&recs, Arc::new(fetcher), 2, false).await;

        assert_eq!(summary.processed, 5);
        assert_eq!(summary.fingerprints.len(), 2);
        assert_eq!(summary.failures.len(), 3);
        assert_eq!(summary.errors_by_reason["wrong_content_type"], 1);
        assert_eq!(summary.errors_by_reason["zero_bytes"], 1);
        // unknown url in the static table
        assert_eq!(summary.errors_by_reason["download_error"], 1);
        for rec in &recs {
            assert!(summary.fingerprints.contains_key(&rec.id) ^ summary.failures.contains_key(&rec.id));
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let gauge = Arc::new(Gauge::default());
        let summary = fingerprint_all(&records(40), gauge.clone(), 4, false).await;
        assert!(gauge.peak.load(Ordering::SeqCst) <= 4);
        assert!(gauge.peak.load(Ordering::SeqCst) >= 2);
        assert_eq!(summary.fingerprints.len(), 36);
        assert_eq!(summary.errors_by_reason["timeout"], 4);
    }

    #[tokio::test]
    async fn oversized_concurrency_is_clamped() {
        let fetcher = StaticFetcher::default().with("https://img.example/1.png", 1);
        let summary = fingerprint_all(&records(2), Arc::new(fetcher), usize::MAX, false).await;
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.fingerprints.len(), 1);
    }

    #[tokio::test]
    async fn empty_input() {
        let summary = fingerprint_all(&[], Arc::new(StaticFetcher::default()), 3, false).await;
        assert_eq!(summary.processed, 0);
        assert!(summary.fingerprints.is_empty());
    }
}
