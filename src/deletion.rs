use serde::Serialize;

use crate::rate_limit::Throttle;
use crate::store::RecordDeleter;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeletionOutcome {
    pub attempted: u64,
    /// Sum of affected rows, never the attempt count.
    pub deleted: u64,
    pub failed: u64,
    pub already_absent: u64,
    pub failed_ids: Vec<i64>,
}

/// Delete `ids` in order, one unit of work each. A failing id is rolled back
/// by the deleter and recorded; the batch carries on.
pub async fn apply(deleter: &mut dyn RecordDeleter, ids: &[i64], throttle: &mut Throttle) -> DeletionOutcome {
    let mut out = DeletionOutcome::default();

    for &id in ids {
        throttle.wait().await;
        out.attempted += 1;
        match deleter.delete(id).await {
            Ok(0) => {
                out.already_absent += 1;
                tracing::warn!(id, "delete affected 0 rows, already gone?");
            }
            Ok(rows) => {
                out.deleted += rows;
                tracing::info!(id, rows, "deleted");
            }
            Err(e) => {
                out.failed += 1;
                out.failed_ids.push(id);
                tracing::error!(id, error = %e, "delete failed, rolled back");
            }
        }
    }

    out
}
