use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cluster::ClusterMode;
use crate::fingerprint::HashKind;

pub const MAX_CONCURRENCY: usize = 1024;
pub const MAX_NUM_PERM: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseCfg {
    pub url_env: String,
    pub table: String,
    pub id_column: String,
    pub url_column: String,
    pub metadata_table: Option<String>,
    pub metadata_fk_column: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseCfg {
    fn default() -> Self {
        Self {
            url_env: "DATABASE_URL".into(),
            table: "arts".into(),
            id_column: "id".into(),
            url_column: "src".into(),
            metadata_table: Some("art_metadata".into()),
            metadata_fk_column: Some("art_id".into()),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchCfg {
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub max_bytes: u64,
    pub user_agent: String,
    pub allowed_content_types: Vec<String>,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_jitter_ms: u64,
    pub progress: bool,
}

impl Default for FetchCfg {
    fn default() -> Self {
        Self {
            concurrency: 10,
            timeout_secs: 20,
            max_bytes: 50 * 1024 * 1024,
            user_agent: "Mozilla/5.0 (compatible; ImageDeduplicationBot/1.0)".into(),
            allowed_content_types: ["image/jpeg", "image/png", "image/gif", "image/webp", "image/bmp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_attempts: 1,
            backoff_base_ms: 500,
            backoff_factor: 2.0,
            backoff_jitter_ms: 250,
            progress: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintCfg { pub algorithm: HashKind, pub dct: bool }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexCfg {
    pub num_perm: usize,
    pub bands: usize,
    pub rows: usize,
    /// When set, `bands`/`rows` are derived from this Jaccard threshold.
    pub threshold: Option<f64>,
    pub seed: u64,
}

impl Default for IndexCfg {
    fn default() -> Self {
        Self { num_perm: 128, bands: 32, rows: 4, threshold: None, seed: 42 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterCfg { pub hamming_threshold: u32, pub mode: ClusterMode }

impl Default for ClusterCfg {
    fn default() -> Self {
        Self { hamming_threshold: 6, mode: ClusterMode::Transitive }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteCfg { pub dry_run: bool, pub delay_ms: u64 }

impl Default for DeleteCfg {
    fn default() -> Self {
        Self { dry_run: true, delay_ms: 100 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunCfg {
    pub database: DatabaseCfg,
    pub fetch: FetchCfg,
    pub fingerprint: FingerprintCfg,
    pub index: IndexCfg,
    pub cluster: ClusterCfg,
    pub delete: DeleteCfg,
    pub plan_out: Option<PathBuf>,
}

impl RunCfg {
    /// Load from YAML. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(txt) => serde_yaml::from_str(&txt)
                .with_context(|| format!("failed to parse config {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("failed to read config {}", path.display())),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch.concurrency == 0 || self.fetch.concurrency > MAX_CONCURRENCY {
            bail!("fetch.concurrency must be in 1..={MAX_CONCURRENCY}, got {}", self.fetch.concurrency);
        }
        if self.fetch.max_bytes == 0 {
            bail!("fetch.max_bytes must be greater than 0");
        }
        if self.fetch.max_attempts == 0 {
            bail!("fetch.max_attempts must be at least 1");
        }
        if self.index.threshold.is_none() {
            if self.index.bands == 0 || self.index.rows == 0 {
                bail!("index.bands and index.rows must be greater than 0");
            }
            if self.index.bands.checked_mul(self.index.rows) != Some(self.index.num_perm) {
                bail!(
                    "index.bands ({}) x index.rows ({}) must equal index.num_perm ({})",
                    self.index.bands, self.index.rows, self.index.num_perm
                );
            }
        }
        if self.index.num_perm == 0 || self.index.num_perm > MAX_NUM_PERM {
            bail!("index.num_perm must be in 1..={MAX_NUM_PERM}, got {}", self.index.num_perm);
        }
        if let Some(t) = self.index.threshold {
            if !(t > 0.0 && t < 1.0) {
                bail!("index.threshold must be in (0, 1), got {t}");
            }
        }

        let db = &self.database;
        for (field, ident) in [
            ("database.table", Some(&db.table)),
            ("database.id_column", Some(&db.id_column)),
            ("database.url_column", Some(&db.url_column)),
            ("database.metadata_table", db.metadata_table.as_ref()),
            ("database.metadata_fk_column", db.metadata_fk_column.as_ref()),
        ] {
            if let Some(ident) = ident {
                if !is_safe_identifier(ident) {
                    bail!("{field} is not a valid SQL identifier: {ident:?}");
                }
            }
        }
        Ok(())
    }
}

/// `name` or `schema.name`, each part `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_safe_identifier(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() > 2 {
        return false;
    }
    parts.iter().all(|p| {
        let mut chars = p.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        RunCfg::default().validate().unwrap();
    }

    #[test]
    fn default_allow_list_has_only_decodable_types() {
        let types = FetchCfg::default().allowed_content_types;
        assert!(types.iter().any(|t| t == "image/png"));
        assert!(!types.iter().any(|t| t == "image/avif"));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg: RunCfg = serde_yaml::from_str(
            "cluster:\n  hamming_threshold: 10\n  mode: single_hop\ndelete:\n  dry_run: false\n",
        )
        .unwrap();
        assert_eq!(cfg.cluster.hamming_threshold, 10);
        assert_eq!(cfg.cluster.mode, ClusterMode::SingleHop);
        assert!(!cfg.delete.dry_run);
        assert_eq!(cfg.delete.delay_ms, 100);
        assert_eq!(cfg.database.table, "arts");
        assert_eq!(cfg.fetch.concurrency, 10);
    }

    #[test]
    fn rejects_mismatched_bands() {
        let mut cfg = RunCfg::default();
        cfg.index.bands = 10;
        cfg.index.rows = 10;
        assert!(cfg.validate().is_err());

        cfg.index.threshold = Some(0.5);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut cfg = RunCfg::default();
        cfg.fetch.concurrency = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_oversized_values() {
        let mut cfg = RunCfg::default();
        cfg.fetch.concurrency = usize::MAX;
        assert!(cfg.validate().is_err());
        cfg.fetch.concurrency = MAX_CONCURRENCY;
        cfg.validate().unwrap();

        cfg.index.bands = usize::MAX;
        cfg.index.rows = 2;
        cfg.index.num_perm = usize::MAX - 1;
        assert!(cfg.validate().is_err());

        let mut cfg = RunCfg::default();
        cfg.index.threshold = Some(0.5);
        cfg.index.num_perm = 1 << 40;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn identifiers() {
        assert!(is_safe_identifier("arts"));
        assert!(is_safe_identifier("public.art_metadata"));
        assert!(is_safe_identifier("_x1"));
        assert!(!is_safe_identifier("arts; DROP TABLE users"));
        assert!(!is_safe_identifier("1arts"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("a.b.c"));

        let mut cfg = RunCfg::default();
        cfg.database.url_column = "src OR 1=1".into();
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn missing_file_is_default() {
        let cfg = RunCfg::load(Path::new("/definitely/not/here.yaml")).await.unwrap();
        assert_eq!(cfg.index.num_perm, 128);
    }
}
