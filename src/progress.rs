use crate::models::{FailedItem, ProgressEntry, StageRecord, ValuationResult};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("progress log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("progress entry serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

struct Inner {
    file: tokio::fs::File,
    /// Latest entry per item id, rebuilt from the log on open.
    latest: HashMap<String, ProgressEntry>,
}

/// Append-only journal of stage outcomes. One JSON line per entry; the file
/// is the only durable state, so replaying it reconstructs exactly where a
/// crashed run left off.
pub struct ProgressStore {
    inner: Mutex<Inner>,
}

impl ProgressStore {
    /// Opens (or creates) the log and replays it. A torn final line from an
    /// interrupted write is tolerated; that entry is simply lost and its
    /// stage re-runs.
    pub async fn open(path: &Path) -> Result<Self, ProgressError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut latest: HashMap<String, ProgressEntry> = HashMap::new();
        let mut replayed = 0usize;
        let mut needs_newline = false;
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                needs_newline = !contents.is_empty() && !contents.ends_with('\n');
                let lines: Vec<&str> = contents.lines().collect();
                for (index, line) in lines.iter().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ProgressEntry>(line) {
                        Ok(entry) => {
                            latest.insert(entry.item_id.clone(), entry);
                            replayed += 1;
                        }
                        Err(err) if index + 1 == lines.len() => {
                            warn!(
                                target = "lotscout.progress",
                                error = %err,
                                "discarding torn final line in progress log"
                            );
                        }
                        Err(err) => {
                            warn!(
                                target = "lotscout.progress",
                                line = index + 1,
                                error = %err,
                                "skipping unreadable progress entry"
                            );
                        }
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if replayed > 0 {
            info!(
                target = "lotscout.progress",
                entries = replayed,
                items = latest.len(),
                "replayed progress log"
            );
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        // Terminate a torn final line so the next append starts clean.
        if needs_newline {
            file.write_all(b"\n").await?;
            file.flush().await?;
        }

        Ok(Self {
            inner: Mutex::new(Inner { file, latest }),
        })
    }

    /// Appends one entry and flushes before the outcome is considered
    /// recorded.
    pub async fn append(&self, entry: ProgressEntry) -> Result<(), ProgressError> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut inner = self.inner.lock().await;
        inner.file.write_all(line.as_bytes()).await?;
        inner.file.flush().await?;
        inner.latest.insert(entry.item_id.clone(), entry);
        Ok(())
    }

    pub async fn latest(&self, item_id: &str) -> Option<ProgressEntry> {
        self.inner.lock().await.latest.get(item_id).cloned()
    }

    /// Items whose latest entry is a completed valuation.
    pub async fn completed_valuations(&self) -> Vec<ValuationResult> {
        self.inner
            .lock()
            .await
            .latest
            .values()
            .filter_map(|entry| match &entry.record {
                StageRecord::Valuated { result } => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    /// Items whose latest entry is a terminal failure, with stage and reason.
    pub async fn failures(&self) -> Vec<FailedItem> {
        self.inner
            .lock()
            .await
            .latest
            .values()
            .filter_map(|entry| match &entry.record {
                StageRecord::Failed { stage, reason } => Some(FailedItem {
                    item_id: entry.item_id.clone(),
                    stage: *stage,
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}
