//! # FiMesh - File Transfer over Mesh Text Messages
//!
//! Moves whole files between nodes as a sequence of integrity-checked, flow-controlled
//! frames. Every frame is one ordinary text message handed to a [`FrameSender`] (the
//! delivery manager in production), so transfers share the radio budget with chat.
//!
//! ## Roles
//!
//! - **Uploader**: a file in `out/` named `<name>___<hex_node>.<ext>` is pushed to that
//!   node: `PING` → wait for `PONG` → manifest → windowed `DAT` frames → `ACK`s.
//! - **Downloader**: passive. The first `MAN` frame for an unseen session id creates a
//!   download; each `DAT` is stored and ACKed immediately; once every chunk in the
//!   manifest is present and verified the file is written to `in/temp/` and renamed into
//!   `in/`. Recently finished session ids are remembered so that late duplicates
//!   neither restart the download nor write the file twice.
//!
//! ## Scheduling
//!
//! Sessions have no tasks of their own. [`FiMesh::tick_at`] advances every session once;
//! inbound frames only update session state and answer with `PONG`/`ACK`. The engine is
//! owned by a single driver, so the session registry needs no locking.
//!
//! ## Directory layout
//!
//! ```text
//! fimesh/
//! ├── in/         completed downloads
//! │   └── temp/   staging before the atomic rename
//! ├── out/        upload queue (<name>___<hex_node>.<ext>, ___failed on permanent failure)
//! │   └── sent/   uploads that completed
//! └── hash/       reserved
//! ```

pub mod download;
pub mod manifest;
pub mod naming;
pub mod upload;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::codec::{self, CodecError, Frame, Packet};
use crate::logutil::preview_frame;
use crate::meshtastic::format_node_id;
use crate::metrics;
use crate::storage::{
    StorageError, TransferDirection, TransferRecord, TransferStatus, TransferStore, TransferUpdate,
};

use download::{AssemblyError, DownloadLimits, DownloadSession, DownloadStep, DownloadTimeout};
use naming::{OutboxTarget, parse_outbox_name};
use upload::{UploadFailure, UploadSession, UploadStep};

/// Send path used for every frame. Returns whether the frame went on the air.
#[async_trait]
pub trait FrameSender: Send + Sync {
    async fn send_frame(&self, text: &str, node: u32) -> bool;
}

#[derive(Debug, Clone)]
pub struct FimeshTuning {
    pub chunk_size: usize,
    pub initial_window: u32,
    pub max_window_size: u32,
    pub base_timeout: Duration,
    pub max_timeout: Duration,
    pub backoff_factor: u32,
    pub max_retries: u32,
    pub total_timeout: Duration,
    pub pong_timeout: Duration,
    pub download_idle_timeout: Duration,
    pub download_total_timeout: Duration,
    pub max_file_bytes: u64,
}

impl Default for FimeshTuning {
    fn default() -> Self {
        Self {
            chunk_size: codec::MAX_CHUNK_PAYLOAD,
            initial_window: 2,
            max_window_size: 10,
            base_timeout: Duration::seconds(180),
            max_timeout: Duration::seconds(600),
            backoff_factor: 2,
            max_retries: 5,
            total_timeout: Duration::seconds(1800),
            pong_timeout: Duration::seconds(60),
            download_idle_timeout: Duration::seconds(300),
            download_total_timeout: Duration::seconds(1800),
            max_file_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// The on-disk directories used by the engine.
#[derive(Debug, Clone)]
pub struct FimeshDirs {
    pub root: PathBuf,
    pub inbox: PathBuf,
    pub inbox_temp: PathBuf,
    pub outbox: PathBuf,
    pub sent: PathBuf,
    pub hash: PathBuf,
}

impl FimeshDirs {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            inbox: root.join("in"),
            inbox_temp: root.join("in").join("temp"),
            outbox: root.join("out"),
            sent: root.join("out").join("sent"),
            hash: root.join("hash"),
            root,
        }
    }

    pub fn create(&self) -> std::io::Result<()> {
        for dir in [&self.inbox, &self.inbox_temp, &self.outbox, &self.sent, &self.hash] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Copy `src` into the outbox under the routing name for `node`.
    pub fn queue_file(&self, src: &Path, node: u32) -> Result<PathBuf, TransferError> {
        if !src.is_file() {
            return Err(TransferError::NotAFile(src.display().to_string()));
        }
        let name = src
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::NotAFile(src.display().to_string()))?;
        std::fs::create_dir_all(&self.outbox)?;
        let dest = naming::unique_path(&self.outbox, &naming::outbox_name(name, node));
        std::fs::copy(src, &dest)?;
        Ok(dest)
    }
}

/// How many finished download ids are remembered for duplicate suppression.
const FINISHED_MEMORY: usize = 64;

/// How a download that is no longer active ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedDownload {
    Completed,
    Abandoned,
}

/// Active sessions keyed by session id, one map per direction, plus the ids of
/// downloads that finished recently.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    uploads: HashMap<String, UploadSession>,
    downloads: HashMap<String, DownloadSession>,
    finished: VecDeque<(String, FinishedDownload)>,
}

impl SessionRegistry {
    pub fn finished_download(&self, session_id: &str) -> Option<FinishedDownload> {
        self.finished
            .iter()
            .find(|(sid, _)| sid == session_id)
            .map(|(_, outcome)| *outcome)
    }

    /// Drop the active download and remember how it ended; oldest entries fall off.
    fn finish_download(&mut self, session_id: &str, outcome: FinishedDownload) {
        self.downloads.remove(session_id);
        self.finished.retain(|(sid, _)| sid != session_id);
        self.finished.push_back((session_id.to_string(), outcome));
        while self.finished.len() > FINISHED_MEMORY {
            self.finished.pop_front();
        }
    }

    pub fn upload(&self, session_id: &str) -> Option<&UploadSession> {
        self.uploads.get(session_id)
    }

    pub fn download(&self, session_id: &str) -> Option<&DownloadSession> {
        self.downloads.get(session_id)
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.len()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.len()
    }

    fn has_upload_for(&self, path: &Path) -> bool {
        self.uploads.values().any(|u| u.file_path == path)
    }

    fn sorted_upload_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.uploads.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn sorted_download_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.downloads.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Eight lowercase hex characters from a random UUID.
pub fn new_session_id() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    simple[..8].to_string()
}

pub struct FiMesh {
    sender: Arc<dyn FrameSender>,
    store: Arc<dyn TransferStore>,
    dirs: FimeshDirs,
    tuning: FimeshTuning,
    sessions: SessionRegistry,
}

impl FiMesh {
    pub fn new(
        sender: Arc<dyn FrameSender>,
        store: Arc<dyn TransferStore>,
        base_dir: impl AsRef<Path>,
        tuning: FimeshTuning,
    ) -> Result<Self, TransferError> {
        let dirs = FimeshDirs::new(base_dir);
        dirs.create()?;
        Ok(Self {
            sender,
            store,
            dirs,
            tuning,
            sessions: SessionRegistry::default(),
        })
    }

    pub fn dirs(&self) -> &FimeshDirs {
        &self.dirs
    }

    pub fn tuning(&self) -> &FimeshTuning {
        &self.tuning
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Route inbound text. Returns false when the text is not FiMesh traffic.
    pub async fn handle_text(&mut self, text: &str, from: u32) -> bool {
        self.handle_text_at(text, from, Utc::now()).await
    }

    pub async fn handle_text_at(&mut self, text: &str, from: u32, now: DateTime<Utc>) -> bool {
        if !codec::is_fimesh(text) {
            return false;
        }
        match codec::parse_frame(text) {
            Ok(frame) => self.handle_frame_at(frame, from, now).await,
            Err(e) => warn!(
                "Dropping malformed frame from {}: {} ({})",
                format_node_id(from),
                e,
                preview_frame(text)
            ),
        }
        true
    }

    pub async fn handle_frame_at(&mut self, frame: Frame, from: u32, now: DateTime<Utc>) {
        let sid = frame.session_id;
        match frame.packet {
            Packet::Ping => {
                debug!("PING {} from {}", sid, format_node_id(from));
                self.send(Frame::new(sid, Packet::Pong), from).await;
            }
            Packet::Pong => {
                let moved = match self.sessions.uploads.get_mut(&sid) {
                    Some(upload) if upload.target == from => upload.on_pong(now),
                    Some(_) => {
                        warn!("PONG for {} from unexpected node {}", sid, format_node_id(from));
                        false
                    }
                    None => false,
                };
                if moved {
                    info!("{} answered PING, starting transfer {}", format_node_id(from), sid);
                    self.update_record(&sid, TransferUpdate::status(TransferStatus::SendingManifest));
                }
            }
            Packet::Ack { seq } => {
                let progress = match self.sessions.uploads.get_mut(&sid) {
                    Some(upload) => {
                        if upload.on_ack(seq, now) {
                            Some(upload.progress())
                        } else {
                            debug!("Duplicate ACK {:04x} for {}", seq, sid);
                            None
                        }
                    }
                    None => None,
                };
                if let Some(p) = progress {
                    self.update_record(
                        &sid,
                        TransferUpdate::status(TransferStatus::Transferring).progress(p),
                    );
                }
            }
            Packet::Manifest { seq, is_last, payload } => {
                self.on_manifest(sid, seq, is_last, &payload, from, now);
            }
            Packet::Data { seq, payload } => {
                self.on_data(sid, seq, &payload, from, now).await;
            }
        }
    }

    fn on_manifest(&mut self, sid: String, seq: u32, is_last: bool, payload: &str, from: u32, now: DateTime<Utc>) {
        if self.sessions.uploads.contains_key(&sid) {
            debug!("Ignoring MAN for our own upload session {}", sid);
            return;
        }
        if let Some(outcome) = self.sessions.finished_download(&sid) {
            debug!("Ignoring MAN {:04x} for finished download {} ({:?})", seq, sid, outcome);
            return;
        }
        if !self.sessions.downloads.contains_key(&sid) {
            info!("Incoming transfer {} from {}", sid, format_node_id(from));
            let record = TransferRecord {
                session_id: sid.clone(),
                file_name: String::new(),
                file_size: 0,
                total_chunks: 0,
                direction: TransferDirection::Download,
                peer: from,
                status: TransferStatus::ReceivingManifest,
                progress: 0,
                created_at: now,
                updated_at: now,
                error: None,
            };
            if let Err(e) = self.store.create_transfer(&record) {
                error!("Could not create transfer record {}: {}", sid, e);
            }
            let limits = DownloadLimits::from_tuning(&self.tuning);
            self.sessions.downloads.insert(
                sid.clone(),
                DownloadSession::new(sid.clone(), from, now).with_limits(limits),
            );
        }

        let result = match self.sessions.downloads.get_mut(&sid) {
            Some(download) => download
                .on_manifest_segment(seq, is_last, payload, now)
                .map(|m| m.cloned()),
            None => return,
        };
        match result {
            Ok(Some(manifest)) => {
                info!(
                    "Manifest for {}: '{}' {} bytes in {} chunks",
                    sid,
                    manifest.file_name,
                    manifest.file_size,
                    manifest.total_chunks()
                );
                self.update_record(
                    &sid,
                    TransferUpdate {
                        status: Some(TransferStatus::Receiving),
                        file_name: Some(manifest.file_name.clone()),
                        file_size: Some(manifest.file_size),
                        total_chunks: Some(manifest.total_chunks()),
                        ..Default::default()
                    },
                );
            }
            Ok(None) => {}
            Err(e) => {
                error!("Manifest for {} is unusable: {}", sid, e);
                self.sessions.finish_download(&sid, FinishedDownload::Abandoned);
                metrics::inc_downloads_failed();
                self.update_record(&sid, TransferUpdate::status(TransferStatus::Failed).error(e.to_string()));
            }
        }
    }

    async fn on_data(&mut self, sid: String, seq: u32, payload: &str, from: u32, now: DateTime<Utc>) {
        match self.sessions.finished_download(&sid) {
            Some(FinishedDownload::Completed) => {
                // The file is already in; a lost ACK is the likely reason for the resend
                debug!("Re-ACKing DAT {:04x} for completed download {}", seq, sid);
                self.send(Frame::new(sid, Packet::Ack { seq }), from).await;
                return;
            }
            Some(FinishedDownload::Abandoned) => {
                debug!("Dropping DAT {:04x} for abandoned download {}", seq, sid);
                return;
            }
            None => {}
        }
        let download = match self.sessions.downloads.get_mut(&sid) {
            Some(d) => d,
            None => {
                debug!("DAT {:04x} for unknown session {} from {}", seq, sid, format_node_id(from));
                return;
            }
        };
        if let Err(e) = download.on_data(seq, payload, now) {
            warn!("Dropping DAT {:04x} for {}: {}", seq, sid, e);
            return;
        }
        let progress = download.progress();
        self.send(Frame::new(sid.clone(), Packet::Ack { seq }), from).await;
        self.update_record(&sid, TransferUpdate::default().progress(progress));
    }

    /// Advance every session once.
    pub async fn tick(&mut self) {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&mut self, now: DateTime<Utc>) {
        for sid in self.sessions.sorted_upload_ids() {
            let mut upload = match self.sessions.uploads.remove(&sid) {
                Some(u) => u,
                None => continue,
            };
            let step = upload.step(now, &self.tuning);
            let keep = self.apply_upload_step(&mut upload, step).await;
            if keep {
                self.sessions.uploads.insert(sid, upload);
            }
        }

        for sid in self.sessions.sorted_download_ids() {
            let step = match self.sessions.downloads.get(&sid) {
                Some(d) => d.step(now, &self.tuning),
                None => continue,
            };
            match step {
                DownloadStep::Wait => {}
                DownloadStep::Assemble => self.assemble_download(&sid).await,
                DownloadStep::TimedOut(kind) => {
                    let reason = match kind {
                        DownloadTimeout::Idle => "no packets within idle timeout",
                        DownloadTimeout::Total => "total transfer time exceeded",
                    };
                    warn!("Download {} timed out: {}", sid, reason);
                    self.sessions.finish_download(&sid, FinishedDownload::Abandoned);
                    metrics::inc_downloads_failed();
                    self.update_record(&sid, TransferUpdate::status(TransferStatus::TimedOut).error(reason));
                }
            }
        }
    }

    /// Returns whether the session stays active.
    async fn apply_upload_step(&mut self, upload: &mut UploadSession, step: UploadStep) -> bool {
        match step {
            UploadStep::Wait => true,
            UploadStep::SendManifest(frames) => {
                debug!("Sending {} manifest segments for {}", frames.len(), upload.session_id);
                for frame in frames {
                    self.send(frame, upload.target).await;
                }
                self.update_record(
                    &upload.session_id,
                    TransferUpdate::status(TransferStatus::Transferring).progress(upload.progress()),
                );
                true
            }
            UploadStep::Send(frames) => {
                for frame in frames {
                    self.send(frame, upload.target).await;
                }
                true
            }
            UploadStep::Retransmit(frames) => {
                info!(
                    "Retry {} for upload {}: resending {} frames, timeout now {}s, window {}",
                    upload.retry_count(),
                    upload.session_id,
                    frames.len(),
                    upload.current_timeout().num_seconds(),
                    upload.window().size()
                );
                metrics::add_chunk_retransmits(frames.len() as u64);
                self.update_record(&upload.session_id, TransferUpdate::status(TransferStatus::Retrying));
                for frame in frames {
                    self.send(frame, upload.target).await;
                }
                true
            }
            UploadStep::Complete => {
                self.complete_upload(upload).await;
                false
            }
            UploadStep::Fail(reason) => {
                self.fail_upload(upload, reason).await;
                false
            }
        }
    }

    async fn complete_upload(&self, upload: &UploadSession) {
        info!(
            "Upload {} of '{}' to {} complete ({} chunks, {} retransmitted)",
            upload.session_id,
            upload.file_name,
            format_node_id(upload.target),
            upload.total_chunks(),
            upload.retransmitted()
        );
        if let Some(name) = upload.file_path.file_name().and_then(|n| n.to_str()) {
            let dest = naming::unique_path(&self.dirs.sent, name);
            if let Err(e) = tokio::fs::rename(&upload.file_path, &dest).await {
                warn!("Could not move {} to sent: {}", upload.file_path.display(), e);
            }
        }
        metrics::inc_uploads_completed();
        self.update_record(
            &upload.session_id,
            TransferUpdate::status(TransferStatus::Completed).progress(100),
        );
    }

    async fn fail_upload(&self, upload: &UploadSession, reason: UploadFailure) {
        warn!(
            "Upload {} to {} failed: {}",
            upload.session_id,
            format_node_id(upload.target),
            reason.describe()
        );
        self.mark_source_failed(&upload.file_path).await;
        metrics::inc_uploads_failed();
        self.update_record(
            &upload.session_id,
            TransferUpdate::status(TransferStatus::Failed).error(reason.describe()),
        );
    }

    async fn mark_source_failed(&self, path: &Path) {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => return,
        };
        let failed = path.with_file_name(naming::failed_name(name));
        match tokio::fs::rename(path, &failed).await {
            Ok(()) => debug!("Marked {} as failed", failed.display()),
            Err(e) => warn!("File {} not renamed after failure: {}", path.display(), e),
        }
    }

    async fn assemble_download(&mut self, sid: &str) {
        let result = match self.sessions.downloads.get_mut(sid) {
            Some(d) => d.assemble(),
            None => return,
        };
        match result {
            Ok(data) => {
                let name = self
                    .sessions
                    .downloads
                    .get(sid)
                    .and_then(|d| d.manifest())
                    .map(|m| naming::sanitize_file_name(&m.file_name))
                    .unwrap_or_else(|| naming::sanitize_file_name(""));
                match self.write_inbox(sid, &name, &data).await {
                    Ok(path) => {
                        self.sessions.finish_download(sid, FinishedDownload::Completed);
                        info!("Received {} ({} bytes) via {}", path.display(), data.len(), sid);
                        metrics::inc_downloads_assembled();
                        self.update_record(sid, TransferUpdate::status(TransferStatus::Completed).progress(100));
                    }
                    Err(e) => {
                        error!("Could not store download {}: {}", sid, e);
                        self.sessions.finish_download(sid, FinishedDownload::Abandoned);
                        metrics::inc_downloads_failed();
                        self.update_record(sid, TransferUpdate::status(TransferStatus::Failed).error(e.to_string()));
                    }
                }
            }
            Err(AssemblyError::HashMismatch(bad)) => {
                error!("Download {}: digest mismatch for chunks {:?}; nothing written", sid, bad);
                let progress = self.sessions.downloads.get(sid).map(|d| d.progress()).unwrap_or(0);
                self.update_record(
                    sid,
                    TransferUpdate::status(TransferStatus::HashMismatch)
                        .progress(progress)
                        .error(format!("digest mismatch for {} chunks", bad.len())),
                );
            }
            Err(e) => {
                error!("Download {} could not be assembled: {}", sid, e);
                self.sessions.finish_download(sid, FinishedDownload::Abandoned);
                metrics::inc_downloads_failed();
                self.update_record(sid, TransferUpdate::status(TransferStatus::Failed).error(e.to_string()));
            }
        }
    }

    /// Stage in `in/temp/` then rename into `in/` without overwriting anything.
    async fn write_inbox(&self, sid: &str, name: &str, data: &[u8]) -> std::io::Result<PathBuf> {
        let temp = self.dirs.inbox_temp.join(format!("{}_{}", sid, name));
        tokio::fs::write(&temp, data).await?;
        let dest = naming::unique_path(&self.dirs.inbox, name);
        if let Err(e) = tokio::fs::rename(&temp, &dest).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }
        Ok(dest)
    }

    /// Start one upload per eligible outbox file. Returns how many were started.
    pub async fn scan_outbox(&mut self) -> usize {
        self.scan_outbox_at(Utc::now()).await
    }

    pub async fn scan_outbox_at(&mut self, now: DateTime<Utc>) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.dirs.outbox).await {
            Ok(rd) => rd,
            Err(e) => {
                warn!("Cannot read outbox {}: {}", self.dirs.outbox.display(), e);
                return 0;
            }
        };
        let mut candidates = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if !path.is_file() {
                        continue;
                    }
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        candidates.push((name.to_string(), path));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Outbox scan interrupted: {}", e);
                    break;
                }
            }
        }
        candidates.sort();

        let mut started = 0;
        for (name, path) in candidates {
            let entry = match parse_outbox_name(&name) {
                Some(e) => e,
                None => {
                    debug!("Outbox file '{}' has no routing suffix; skipping", name);
                    continue;
                }
            };
            let target = match entry.target {
                OutboxTarget::Failed => continue,
                OutboxTarget::Node(n) => n,
            };
            if self.sessions.has_upload_for(&path) {
                continue;
            }
            match self.start_upload_at(&path, &entry.transfer_name, target, now).await {
                Ok(_) => started += 1,
                Err(e) => warn!("Upload of {} not started: {}", name, e),
            }
        }
        started
    }

    /// Begin pushing `path` to `target`: create the record, send PING, await PONG on ticks.
    pub async fn start_upload_at(
        &mut self,
        path: &Path,
        transfer_name: &str,
        target: u32,
        now: DateTime<Utc>,
    ) -> Result<String, TransferError> {
        let mut session_id = new_session_id();
        while self.sessions.uploads.contains_key(&session_id) || self.sessions.downloads.contains_key(&session_id) {
            session_id = new_session_id();
        }

        let size = tokio::fs::metadata(path).await?.len();
        if size > self.tuning.max_file_bytes {
            self.store.create_transfer(&TransferRecord {
                session_id: session_id.clone(),
                file_name: transfer_name.to_string(),
                file_size: size,
                total_chunks: 0,
                direction: TransferDirection::Upload,
                peer: target,
                status: TransferStatus::Failed,
                progress: 0,
                created_at: now,
                updated_at: now,
                error: Some("file too large".to_string()),
            })?;
            self.mark_source_failed(path).await;
            metrics::inc_uploads_failed();
            return Err(TransferError::TooLarge {
                size,
                limit: self.tuning.max_file_bytes,
            });
        }

        let data = tokio::fs::read(path).await?;
        let upload = UploadSession::new(
            session_id.clone(),
            path.to_path_buf(),
            transfer_name,
            &data,
            target,
            &self.tuning,
            now,
        )?;
        self.store.create_transfer(&TransferRecord {
            session_id: session_id.clone(),
            file_name: upload.file_name.clone(),
            file_size: upload.file_size,
            total_chunks: upload.total_chunks(),
            direction: TransferDirection::Upload,
            peer: target,
            status: TransferStatus::Connecting,
            progress: 0,
            created_at: now,
            updated_at: now,
            error: None,
        })?;
        info!(
            "Upload {} of '{}' ({} bytes, {} chunks) to {}: sending PING",
            session_id,
            upload.file_name,
            upload.file_size,
            upload.total_chunks(),
            format_node_id(target)
        );
        let ping = upload.ping_frame();
        self.sessions.uploads.insert(session_id.clone(), upload);
        self.send(ping, target).await;
        Ok(session_id)
    }

    async fn send(&self, frame: Frame, node: u32) {
        let text = frame.encode();
        if !self.sender.send_frame(&text, node).await {
            debug!("Frame {} to {} not on air yet", preview_frame(&text), format_node_id(node));
        }
    }

    fn update_record(&self, session_id: &str, update: TransferUpdate) {
        if let Err(e) = self.store.update_transfer(session_id, update) {
            error!("Transfer record {} not updated: {}", session_id, e);
        }
    }
}
