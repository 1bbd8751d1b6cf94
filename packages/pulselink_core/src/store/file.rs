//! Durable remote store backed by a JSON-lines append log
//!
//! Every accepted write is one line `{"path": "...", "value": ...}` in
//! `{data_dir}/append_log.jsonl`. Opening the store replays the log into an
//! `InMemoryStore`, which serves reads and listeners.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{
    ChildSubscription, InMemoryStore, ListenerHandle, RemoteStore, SessionSummary, StoreError,
    StorePath,
};
use crate::types::HeartRateRecord;

const LOG_FILE_NAME: &str = "append_log.jsonl";

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    path: StorePath,
    value: Value,
}

/// The open log file and the length of its last complete line.
struct AppendLog {
    file: tokio::fs::File,
    committed: u64,
    /// A failed append may have left bytes past `committed`.
    torn: bool,
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl AppendLog {
    fn new(file: std::fs::File, committed: u64) -> Self {
        Self {
            file: tokio::fs::File::from_std(file),
            committed,
            torn: false,
            #[cfg(test)]
            fail_after: None,
        }
    }

    /// Append one line durably. On failure the file is cut back to the last
    /// complete line so later appends never land behind partial bytes.
    async fn append(&mut self, line: &[u8]) -> Result<(), StoreError> {
        if self.torn {
            self.truncate().await?;
        }
        if let Err(e) = self.write_line(line).await {
            self.torn = true;
            if let Err(cut) = self.truncate().await {
                log::warn!("[FileStore] Could not cut back a failed append: {}", cut);
            }
            return Err(StoreError::IoError(e.to_string()));
        }
        self.committed += line.len() as u64;
        Ok(())
    }

    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        if let Some(keep) = self.fail_after.take() {
            self.file.write_all(&line[..keep.min(line.len())]).await?;
            self.file.flush().await?;
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        }
        self.file.write_all(line).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }

    async fn truncate(&mut self) -> Result<(), StoreError> {
        self.file
            .set_len(self.committed)
            .await
            .map_err(|e| StoreError::IoError(e.to_string()))?;
        self.torn = false;
        Ok(())
    }
}

pub struct FileStore {
    data_dir: PathBuf,
    log: Mutex<AppendLog>,
    view: InMemoryStore,
}

impl FileStore {
    /// Open (or create) the store in `data_dir` and replay its log.
    ///
    /// A final line that does not parse is treated as a write torn by a
    /// crash: it is logged, dropped and truncated away. A bad line anywhere
    /// else is an error.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::IoError(e.to_string()))?;
        let log_path = data_dir.join(LOG_FILE_NAME);
        let view = InMemoryStore::new();

        let mut valid_len: usize = 0;
        let mut missing_newline = false;
        let mut replayed = 0usize;
        if log_path.exists() {
            let data = std::fs::read(&log_path).map_err(|e| StoreError::IoError(e.to_string()))?;
            let mut offset = 0usize;
            let mut line_no = 0usize;
            while offset < data.len() {
                line_no += 1;
                let (line_end, next) = match data[offset..].iter().position(|b| *b == b'\n') {
                    Some(pos) => (offset + pos, offset + pos + 1),
                    None => (data.len(), data.len()),
                };
                let is_last = next >= data.len();
                let line = String::from_utf8_lossy(&data[offset..line_end]);

                if line.trim().is_empty() {
                    valid_len = next;
                } else {
                    match serde_json::from_str::<LogEntry>(&line) {
                        Ok(entry) => {
                            view.apply(&entry.path, entry.value)?;
                            replayed += 1;
                            valid_len = next;
                            missing_newline = next == line_end;
                        }
                        Err(e) if is_last => {
                            log::warn!(
                                "[FileStore] Dropping torn final entry in {}: {}",
                                log_path.display(),
                                e
                            );
                        }
                        Err(e) => {
                            return Err(StoreError::DeserializationError(format!(
                                "line {}: {}",
                                line_no, e
                            )))
                        }
                    }
                }
                offset = next;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| StoreError::IoError(e.to_string()))?;
        let on_disk = file
            .metadata()
            .map_err(|e| StoreError::IoError(e.to_string()))?
            .len();
        if on_disk != valid_len as u64 {
            file.set_len(valid_len as u64)
                .map_err(|e| StoreError::IoError(e.to_string()))?;
        }
        // The next append must start on a fresh line.
        let mut committed = valid_len as u64;
        if missing_newline {
            file.write_all(b"\n")
                .map_err(|e| StoreError::IoError(e.to_string()))?;
            committed += 1;
        }

        log::info!(
            "[FileStore] Opened {} ({} entries)",
            data_dir.display(),
            replayed
        );

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            log: Mutex::new(AppendLog::new(file, committed)),
            view,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.view.session_summaries()
    }

    pub fn samples(&self, session_id: &str) -> Result<Vec<(String, HeartRateRecord)>, StoreError> {
        self.view.samples(session_id)
    }

    pub fn get(&self, path: &StorePath) -> Option<Value> {
        self.view.get(path)
    }
}

#[async_trait]
impl RemoteStore for FileStore {
    fn push_key(&self) -> String {
        self.view.push_key()
    }

    async fn set_value(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        // Held across check, append and apply so the log and the view agree
        // on order.
        let mut log = self.log.lock().await;
        self.view.check_write(path, &value)?;

        let entry = LogEntry {
            path: path.clone(),
            value,
        };
        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        line.push(b'\n');

        log.append(&line).await?;
        self.view.apply(&entry.path, entry.value)
    }

    async fn observe_child_added(&self, path: &StorePath) -> Result<ChildSubscription, StoreError> {
        self.view.observe_child_added(path).await
    }

    async fn remove_observer(&self, handle: ListenerHandle) {
        self.view.remove_observer(handle).await
    }
}
