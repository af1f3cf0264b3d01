use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::{fs::{self, OpenOptions}, io::AsyncWriteExt};

use crate::retention::RetentionDecision;

#[derive(Debug, Serialize)]
pub struct PlanRecord<'a> {
    pub run_id: &'a str,
    pub dry_run: bool,
    pub kept_id: i64,
    pub delete_ids: &'a [i64],
    pub members: &'a [i64],
    pub with_metadata: &'a [i64],
    pub created_at: String,
}

/// JSONL file with one line per duplicate cluster, written before anything
/// is deleted.
pub struct PlanWriter {
    file: fs::File,
    path: PathBuf,
}

impl PlanWriter {
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    pub async fn append(&mut self, rec: &PlanRecord<'_>) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(rec)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        Ok(())
    }

    pub async fn finish(mut self) -> anyhow::Result<PathBuf> {
        self.file.flush().await?;
        let _ = self.file.sync_all().await; // best-effort
        Ok(self.path)
    }
}

pub async fn write_plan(
    path: &Path,
    run_id: &str,
    dry_run: bool,
    decisions: &[RetentionDecision],
) -> anyhow::Result<PathBuf> {
    let mut w = PlanWriter::open(path).await?;
    let created_at = chrono::Utc::now().to_rfc3339();
    for d in decisions {
        w.append(&PlanRecord {
            run_id,
            dry_run,
            kept_id: d.kept_id,
            delete_ids: &d.delete_ids,
            members: &d.members,
            with_metadata: &d.with_metadata,
            created_at: created_at.clone(),
        })
        .await?;
    }
    w.finish().await
}
