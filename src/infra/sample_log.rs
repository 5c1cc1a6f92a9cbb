//! File-backed JSON-lines sample logs.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tempfile::NamedTempFile;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

pub const SLOW_QUERY_LOG: &str = "slow-queries.jsonl";
pub const OFFLOAD_FAILURE_LOG: &str = "offload-failures.jsonl";

#[derive(Debug, Error)]
pub enum SampleLogError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to encode sample: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{path}: line {line} is not a valid sample: {reason}")]
    Corrupt {
        path: String,
        line: usize,
        reason: String,
    },
    #[error("failed to replace {path}: {reason}")]
    Persist { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub kind: String,
    pub key: String,
    #[serde(default)]
    pub detail: JsonValue,
}

impl SampleEntry {
    pub fn new(kind: impl Into<String>, key: impl Into<String>, detail: JsonValue) -> Self {
        Self {
            recorded_at: OffsetDateTime::now_utc(),
            kind: kind.into(),
            key: key.into(),
            detail,
        }
    }
}

/// Append-only sample log that can be trimmed to its newest entries.
#[derive(Debug)]
pub struct SampleLog {
    path: PathBuf,
    guard: Mutex<()>,
}

impl SampleLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            guard: Mutex::new(()),
        }
    }

    pub fn in_directory(directory: &Path, file_name: &str) -> Self {
        Self::new(directory.join(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub async fn append(&self, entry: &SampleEntry) -> Result<(), SampleLogError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.guard.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// All entries, oldest first. A missing file reads as empty.
    pub async fn read_all(&self) -> Result<Vec<SampleEntry>, SampleLogError> {
        let _guard = self.guard.lock().await;
        let contents = self.read_contents().await?;
        parse_lines(&self.path, &contents).map(|lines| lines.into_iter().map(|(_, e)| e).collect())
    }

    /// Keep only the newest `keep` entries, returning how many were dropped.
    ///
    /// The file is rewritten through a temporary sibling and renamed into place. A file with
    /// unparseable lines is left untouched and reported as corrupt.
    pub async fn trim(&self, keep: usize) -> Result<usize, SampleLogError> {
        let _guard = self.guard.lock().await;
        let contents = self.read_contents().await?;
        let lines = parse_lines(&self.path, &contents)?;
        if lines.len() <= keep {
            return Ok(0);
        }

        let dropped = lines.len() - keep;
        let mut retained = String::new();
        for (raw, _) in &lines[dropped..] {
            retained.push_str(raw);
            retained.push('\n');
        }

        let target = self.path.clone();
        tokio::task::spawn_blocking(move || rewrite(&target, retained.as_bytes()))
            .await
            .map_err(|err| SampleLogError::Persist {
                path: self.path.display().to_string(),
                reason: err.to_string(),
            })??;

        Ok(dropped)
    }

    async fn read_contents(&self) -> Result<String, SampleLogError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }
}

fn parse_lines<'a>(
    path: &Path,
    contents: &'a str,
) -> Result<Vec<(&'a str, SampleEntry)>, SampleLogError> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<SampleEntry>(line)
                .map(|entry| (line, entry))
                .map_err(|err| SampleLogError::Corrupt {
                    path: path.display().to_string(),
                    line: idx + 1,
                    reason: err.to_string(),
                })
        })
        .collect()
}

fn rewrite(target: &Path, contents: &[u8]) -> Result<(), SampleLogError> {
    let directory = target.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(directory)?;
    temp.write_all(contents)?;
    temp.flush()?;
    temp.persist(target).map_err(|err| SampleLogError::Persist {
        path: target.display().to_string(),
        reason: err.error.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn trim_keeps_newest_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = SampleLog::in_directory(dir.path(), SLOW_QUERY_LOG);

        for i in 0..5 {
            log.append(&SampleEntry::new("slow_query", format!("k{i}"), json!({ "i": i })))
                .await
                .expect("append");
        }

        assert_eq!(log.trim(2).await.expect("trim"), 3);
        let entries = log.read_all().await.expect("read");
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["k3", "k4"]);

        assert_eq!(log.trim(2).await.expect("second trim"), 0);
    }

    #[tokio::test]
    async fn missing_log_trims_to_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = SampleLog::in_directory(dir.path(), OFFLOAD_FAILURE_LOG);
        assert_eq!(log.trim(10).await.expect("trim"), 0);
        assert!(log.read_all().await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn corrupt_log_is_reported_and_left_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = SampleLog::in_directory(dir.path(), SLOW_QUERY_LOG);
        let garbage = "not json\n{\"also\": \"wrong\"}\n";
        std::fs::write(log.path(), garbage).expect("seed");

        let err = log.trim(1).await.expect_err("corrupt");
        assert!(matches!(err, SampleLogError::Corrupt { line: 1, .. }));
        assert_eq!(std::fs::read_to_string(log.path()).expect("read"), garbage);
    }
}
