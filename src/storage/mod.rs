//! # Storage Module - Record Persistence
//!
//! The delivery and transfer layers only depend on the [`MessageStore`] and
//! [`TransferStore`] contracts. [`JsonStore`] is the bundled implementation: one JSON
//! document per record kind under the data directory, rewritten atomically on every
//! change.
//!
//! ```text
//! data/
//! ├── messages.json   ← message delivery records keyed by id
//! ├── transfers.json  ← FiMesh transfer records keyed by session id
//! └── presence.json   ← node sightings (written by the presence oracle)
//! ```
//!
//! ## Write discipline
//!
//! Each write takes an exclusive `fs2` lock on a sidecar `.lock` file, writes a unique
//! temp file in the same directory, fsyncs it and renames it over the destination. A
//! crash leaves either the old or the new document, never a torn one.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshrelay::storage::{JsonStore, MessageStore};
//!
//! let store = JsonStore::open("./data").unwrap();
//! let counts = store.count_by_status().unwrap();
//! println!("{:?}", counts);
//! ```

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Errors that can arise while reading or writing persisted records.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    Duplicate(String),
}

/// Delivery status of a message. `Delivered` and `Undelivered` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Queued,
    Delivered,
    Undelivered,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Delivered | MessageStatus::Undelivered)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Queued => "queued",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Undelivered => "undelivered",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub from_node: Option<u32>,
    /// `None` for channel broadcasts
    pub to_node: Option<u32>,
    pub channel: u32,
    pub interface: u8,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub attempt_count: u32,
    #[serde(default)]
    pub defer_count: u32,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Send as a single radio message even if longer than the chat chunk limit
    #[serde(default)]
    pub bypass_chunking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Connecting,
    SendingManifest,
    Transferring,
    Retrying,
    Completed,
    Failed,
    ReceivingManifest,
    Receiving,
    HashMismatch,
    TimedOut,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::TimedOut
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub session_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub direction: TransferDirection,
    pub peer: u32,
    pub status: TransferStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Field changes applied to an existing transfer record.
#[derive(Debug, Clone, Default)]
pub struct TransferUpdate {
    pub status: Option<TransferStatus>,
    pub progress: Option<u8>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub total_chunks: Option<u32>,
    pub error: Option<String>,
}

impl TransferUpdate {
    pub fn status(status: TransferStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Persistence contract used by the delivery manager.
pub trait MessageStore: Send + Sync {
    /// Insert or replace a record.
    fn save_message(&self, record: &MessageRecord) -> Result<(), StorageError>;
    fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, StorageError>;
    fn delete_message(&self, id: &str) -> Result<bool, StorageError>;
    /// `sent` records to `node` created before `created_before` with fewer than `max_attempts` attempts.
    fn pending_sent(
        &self,
        node: u32,
        created_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<MessageRecord>, StorageError>;
    /// `queued` records to `node` with fewer than `max_attempts` attempts whose retry time has passed.
    fn due_queued(
        &self,
        node: u32,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<MessageRecord>, StorageError>;
    /// `queued` broadcast records (no `to_node`) that are due, like [`MessageStore::due_queued`].
    fn due_queued_broadcasts(&self, now: DateTime<Utc>, max_attempts: u32) -> Result<Vec<MessageRecord>, StorageError>;
    fn count_by_status(&self) -> Result<BTreeMap<MessageStatus, usize>, StorageError>;
    /// Remove terminal records created before `before`; returns how many were removed.
    fn prune_terminal(&self, before: DateTime<Utc>) -> Result<usize, StorageError>;
}

/// Persistence contract used by the transfer engine.
pub trait TransferStore: Send + Sync {
    fn create_transfer(&self, record: &TransferRecord) -> Result<(), StorageError>;
    /// Apply `update`. A record already in a terminal status is left as it is.
    fn update_transfer(&self, session_id: &str, update: TransferUpdate) -> Result<(), StorageError>;
    fn get_transfer(&self, session_id: &str) -> Result<Option<TransferRecord>, StorageError>;
    fn list_transfers(&self) -> Result<Vec<TransferRecord>, StorageError>;
}

const MESSAGES_FILE: &str = "messages.json";
const TRANSFERS_FILE: &str = "transfers.json";

/// File-backed store for message and transfer records.
pub struct JsonStore {
    data_dir: PathBuf,
    messages: Mutex<HashMap<String, MessageRecord>>,
    transfers: Mutex<HashMap<String, TransferRecord>>,
}

impl JsonStore {
    /// Open (creating if needed) a store rooted at `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        let messages = load_map(&data_dir.join(MESSAGES_FILE))?;
        let transfers = load_map(&data_dir.join(TRANSFERS_FILE))?;
        Ok(Self {
            data_dir,
            messages: Mutex::new(messages),
            transfers: Mutex::new(transfers),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn messages(&self) -> MutexGuard<'_, HashMap<String, MessageRecord>> {
        match self.messages.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn transfers(&self) -> MutexGuard<'_, HashMap<String, TransferRecord>> {
        match self.transfers.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist_messages(&self, map: &HashMap<String, MessageRecord>) -> Result<(), StorageError> {
        let ordered: BTreeMap<&String, &MessageRecord> = map.iter().collect();
        let content = serde_json::to_vec_pretty(&ordered)?;
        write_locked(&self.data_dir.join(MESSAGES_FILE), &content)
    }

    fn persist_transfers(&self, map: &HashMap<String, TransferRecord>) -> Result<(), StorageError> {
        let ordered: BTreeMap<&String, &TransferRecord> = map.iter().collect();
        let content = serde_json::to_vec_pretty(&ordered)?;
        write_locked(&self.data_dir.join(TRANSFERS_FILE), &content)
    }

    fn select_messages<F>(&self, pred: F) -> Vec<MessageRecord>
    where
        F: Fn(&MessageRecord) -> bool,
    {
        let mut out: Vec<MessageRecord> = self.messages().values().filter(|m| pred(m)).cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }
}

impl MessageStore for JsonStore {
    fn save_message(&self, record: &MessageRecord) -> Result<(), StorageError> {
        let mut map = self.messages();
        map.insert(record.id.clone(), record.clone());
        self.persist_messages(&map)
    }

    fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, StorageError> {
        Ok(self.messages().get(id).cloned())
    }

    fn delete_message(&self, id: &str) -> Result<bool, StorageError> {
        let mut map = self.messages();
        if map.remove(id).is_none() {
            return Ok(false);
        }
        self.persist_messages(&map)?;
        Ok(true)
    }

    fn pending_sent(
        &self,
        node: u32,
        created_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        Ok(self.select_messages(|m| {
            m.status == MessageStatus::Sent
                && !m.delivered
                && m.to_node == Some(node)
                && m.created_at < created_before
                && m.attempt_count < max_attempts
        }))
    }

    fn due_queued(
        &self,
        node: u32,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        Ok(self.select_messages(|m| {
            m.status == MessageStatus::Queued
                && m.to_node == Some(node)
                && m.attempt_count < max_attempts
                && m.next_retry_time.map_or(true, |t| t <= now)
        }))
    }

    fn due_queued_broadcasts(&self, now: DateTime<Utc>, max_attempts: u32) -> Result<Vec<MessageRecord>, StorageError> {
        Ok(self.select_messages(|m| {
            m.status == MessageStatus::Queued
                && m.to_node.is_none()
                && m.attempt_count < max_attempts
                && m.next_retry_time.map_or(true, |t| t <= now)
        }))
    }

    fn count_by_status(&self) -> Result<BTreeMap<MessageStatus, usize>, StorageError> {
        let mut counts = BTreeMap::new();
        for m in self.messages().values() {
            *counts.entry(m.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn prune_terminal(&self, before: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut map = self.messages();
        let initial = map.len();
        map.retain(|_, m| !(m.status.is_terminal() && m.created_at < before));
        let removed = initial - map.len();
        if removed > 0 {
            self.persist_messages(&map)?;
        }
        Ok(removed)
    }
}

impl TransferStore for JsonStore {
    fn create_transfer(&self, record: &TransferRecord) -> Result<(), StorageError> {
        let mut map = self.transfers();
        if map.contains_key(&record.session_id) {
            return Err(StorageError::Duplicate(record.session_id.clone()));
        }
        map.insert(record.session_id.clone(), record.clone());
        self.persist_transfers(&map)
    }

    fn update_transfer(&self, session_id: &str, update: TransferUpdate) -> Result<(), StorageError> {
        let mut map = self.transfers();
        let rec = map
            .get_mut(session_id)
            .ok_or_else(|| StorageError::NotFound(session_id.to_string()))?;
        if rec.status.is_terminal() {
            log::debug!("Transfer {} already finished as {:?}; update ignored", session_id, rec.status);
            return Ok(());
        }
        if let Some(status) = update.status {
            rec.status = status;
        }
        if let Some(progress) = update.progress {
            rec.progress = progress;
        }
        if let Some(name) = update.file_name {
            rec.file_name = name;
        }
        if let Some(size) = update.file_size {
            rec.file_size = size;
        }
        if let Some(total) = update.total_chunks {
            rec.total_chunks = total;
        }
        if update.error.is_some() {
            rec.error = update.error;
        }
        rec.updated_at = Utc::now();
        self.persist_transfers(&map)
    }

    fn get_transfer(&self, session_id: &str) -> Result<Option<TransferRecord>, StorageError> {
        Ok(self.transfers().get(session_id).cloned())
    }

    fn list_transfers(&self) -> Result<Vec<TransferRecord>, StorageError> {
        let mut out: Vec<TransferRecord> = self.transfers().values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }
}

fn load_map<T: serde::de::DeserializeOwned>(path: &Path) -> Result<HashMap<String, T>, StorageError> {
    match fs::read_to_string(path) {
        Ok(data) => {
            // Guard against any accidental leading NULs
            let cleaned = data.trim_start_matches('\0');
            if cleaned.trim().is_empty() {
                return Ok(HashMap::new());
            }
            Ok(serde_json::from_str(cleaned)?)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}

/// Write `content` to `path` under an exclusive lock on a sidecar `.lock` file.
pub fn write_locked(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path.file_name().and_then(|s| s.to_str()).unwrap_or("data.json");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(dir.join(format!(".{}.lock", base)))?;
    lock_file.lock_exclusive()?;
    let result = write_atomic(path, content);
    // Unlock by dropping the lock file
    drop(lock_file);
    result
}

/// Temp file in the same directory, fsync, then rename over the destination.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    if !dir.as_os_str().is_empty() {
        fs::create_dir_all(dir)?;
    }
    let base = path.file_name().and_then(|s| s.to_str()).unwrap_or("data.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content)?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    };

    fs::rename(&tmp_path, path)?;
    // Fsync the directory to persist the rename (best-effort)
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}
