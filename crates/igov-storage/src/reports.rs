//! JSON report files: execution audit reports and dated preview snapshots.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const EXECUTION_REPORT_PREFIX: &str = "image-url-cleanup-";
pub const SNAPSHOT_PREFIX: &str = "daily-preview-";

/// `image-url-cleanup-2026-10-19T08-30-00-123Z.json`
pub fn execution_report_name(at: DateTime<Utc>) -> String {
    let stamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{EXECUTION_REPORT_PREFIX}{stamp}.json")
}

/// `daily-preview-2026-10-19.json`
pub fn snapshot_name(day: NaiveDate) -> String {
    format!("{SNAPSHOT_PREFIX}{}.json", day.format("%Y-%m-%d"))
}

fn leading_date(rest: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(rest.get(..10)?, "%Y-%m-%d").ok()
}

pub fn execution_report_date(file_name: &str) -> Option<NaiveDate> {
    let rest = file_name
        .strip_prefix(EXECUTION_REPORT_PREFIX)?
        .strip_suffix(".json")?;
    leading_date(rest)
}

/// `name` for `attempt` 0, otherwise `name` with `-<attempt>` before `.json`.
pub fn suffixed_name(name: &str, attempt: usize) -> String {
    match (attempt, name.strip_suffix(".json")) {
        (0, _) => name.to_string(),
        (n, Some(stem)) => format!("{stem}-{n}.json"),
        (n, None) => format!("{name}-{n}"),
    }
}

pub fn snapshot_date(file_name: &str) -> Option<NaiveDate> {
    let rest = file_name.strip_prefix(SNAPSHOT_PREFIX)?.strip_suffix(".json")?;
    if rest.len() != 10 {
        return None;
    }
    leading_date(rest)
}

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub file_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serialize `value` and write it via temp file + rename, replacing any previous file.
    pub async fn write_json<T: Serialize>(
        &self,
        file_name: &str,
        value: &T,
    ) -> anyhow::Result<StoredReport> {
        let (temp_path, byte_size) = self.write_temp(file_name, value).await?;
        let absolute_path = self.root.join(file_name);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp report {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredReport {
            file_name: file_name.to_string(),
            absolute_path,
            byte_size,
        })
    }

    /// Like [`write_json`](Self::write_json) but never replaces an existing file.
    /// Returns `Ok(None)` when `file_name` is already taken.
    pub async fn create_json<T: Serialize>(
        &self,
        file_name: &str,
        value: &T,
    ) -> anyhow::Result<Option<StoredReport>> {
        let (temp_path, byte_size) = self.write_temp(file_name, value).await?;
        let absolute_path = self.root.join(file_name);

        let linked = fs::hard_link(&temp_path, &absolute_path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(Some(StoredReport {
                file_name: file_name.to_string(),
                absolute_path,
                byte_size,
            })),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err).with_context(|| {
                format!(
                    "linking temp report {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            }),
        }
    }

    async fn write_temp<T: Serialize>(
        &self,
        file_name: &str,
        value: &T,
    ) -> anyhow::Result<(PathBuf, usize)> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing report {file_name}"))?;
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating report directory {}", self.root.display()))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp report file {}", temp_path.display()))?;
        let written = async {
            file.write_all(&bytes).await?;
            file.flush().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err)
                .with_context(|| format!("writing temp report file {}", temp_path.display()));
        }
        Ok((temp_path, bytes.len()))
    }

    /// Report files whose name starts with `prefix`, sorted by name. A missing
    /// directory yields an empty list.
    pub async fn list(&self, prefix: &str) -> anyhow::Result<Vec<ReportEntry>> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.root.display()))
            }
        };

        let mut out = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with(prefix) && file_name.ends_with(".json") {
                out.push(ReportEntry {
                    path: entry.path(),
                    file_name,
                });
            }
        }
        out.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(out)
    }

    pub async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> anyhow::Result<T> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
