use std::collections::BTreeSet;

use serde::Serialize;

use crate::cluster::Cluster;
use crate::store::{RecordStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionDecision {
    pub members: Vec<i64>,
    pub kept_id: i64,
    pub delete_ids: Vec<i64>,
    pub with_metadata: Vec<i64>,
}

/// Keep the smallest id that has metadata, or the smallest id overall when
/// none does. `with_metadata` may contain ids outside the cluster.
pub fn decide(cluster: &Cluster, with_metadata: &BTreeSet<i64>) -> RetentionDecision {
    let mut members = cluster.members.clone();
    members.sort_unstable();
    members.dedup();

    let flagged: Vec<i64> = members.iter().copied().filter(|id| with_metadata.contains(id)).collect();
    let kept_id = flagged.first().or(members.first()).copied().unwrap_or_default();
    let delete_ids = members.iter().copied().filter(|&id| id != kept_id).collect();

    RetentionDecision { members, kept_id, delete_ids, with_metadata: flagged }
}

/// One metadata lookup per duplicate cluster. Singletons are skipped.
/// A failed lookup aborts: guessing here could delete the annotated copy.
pub async fn resolve_all(
    store: &dyn RecordStore,
    clusters: &[Cluster],
) -> Result<Vec<RetentionDecision>, StoreError> {
    let mut decisions = Vec::new();
    for cluster in clusters.iter().filter(|c| c.is_duplicate()) {
        let with_metadata = store.ids_with_metadata(&cluster.members).await?;
        let decision = decide(cluster, &with_metadata);
        if decision.with_metadata.len() > 1 {
            tracing::warn!(
                kept = decision.kept_id,
                with_metadata = ?decision.with_metadata,
                "several cluster members have metadata, keeping the smallest id"
            );
        }
        tracing::debug!(kept = decision.kept_id, delete = ?decision.delete_ids, "cluster resolved");
        decisions.push(decision);
    }
    Ok(decisions)
}
