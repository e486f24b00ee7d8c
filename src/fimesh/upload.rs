//! Uploader side of a transfer: discovery, manifest, windowed chunks, retransmission.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::path::PathBuf;

use super::manifest::Manifest;
use super::FimeshTuning;
use crate::codec::{self, CodecError, Frame, Packet};

/// AIMD congestion window, always within `1..=max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    size: u32,
    max: u32,
}

impl Window {
    pub fn new(initial: u32, max: u32) -> Self {
        let max = max.max(1);
        Self {
            size: initial.clamp(1, max),
            max,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Additive increase on a fresh ACK.
    pub fn on_ack(&mut self) {
        self.size = (self.size + 1).min(self.max);
    }

    /// Multiplicative decrease on a retransmission event.
    pub fn on_retransmit(&mut self) {
        self.size = (self.size / 2).max(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    AwaitingPong,
    SendingManifest,
    Transferring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFailure {
    NoPong,
    RetriesExhausted,
    TotalTimeout,
}

impl UploadFailure {
    pub fn describe(&self) -> &'static str {
        match self {
            UploadFailure::NoPong => "target did not answer PING",
            UploadFailure::RetriesExhausted => "retry budget exhausted",
            UploadFailure::TotalTimeout => "total transfer time exceeded",
        }
    }
}

/// What the engine should do for this session on the current tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStep {
    Wait,
    SendManifest(Vec<Frame>),
    Send(Vec<Frame>),
    Retransmit(Vec<Frame>),
    Complete,
    Fail(UploadFailure),
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub session_id: String,
    pub file_path: PathBuf,
    /// Name announced in the manifest
    pub file_name: String,
    pub file_size: u64,
    pub target: u32,
    chunks: Vec<Vec<u8>>,
    manifest_frames: Vec<Frame>,
    acked: BTreeSet<u32>,
    window: Window,
    next_chunk_to_send: u32,
    current_timeout: Duration,
    retry_count: u32,
    start_time: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    state: UploadState,
    retransmitted: u64,
}

impl UploadSession {
    pub fn new(
        session_id: impl Into<String>,
        file_path: PathBuf,
        file_name: &str,
        data: &[u8],
        target: u32,
        tuning: &FimeshTuning,
        now: DateTime<Utc>,
    ) -> Result<Self, CodecError> {
        let session_id = session_id.into();
        let compressed = codec::compress(data)?;
        let chunks = codec::split_bytes(&compressed, tuning.chunk_size);
        let manifest = Manifest::for_chunks(file_name, data.len() as u64, &chunks);
        let manifest_frames = manifest.to_frames(&session_id, tuning.chunk_size)?;
        Ok(Self {
            session_id,
            file_path,
            file_name: manifest.file_name.clone(),
            file_size: data.len() as u64,
            target,
            chunks,
            manifest_frames,
            acked: BTreeSet::new(),
            window: Window::new(tuning.initial_window, tuning.max_window_size),
            next_chunk_to_send: 0,
            current_timeout: tuning.base_timeout,
            retry_count: 0,
            start_time: now,
            last_activity: now,
            state: UploadState::AwaitingPong,
            retransmitted: 0,
        })
    }

    pub fn ping_frame(&self) -> Frame {
        Frame::new(self.session_id.clone(), Packet::Ping)
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn acked_count(&self) -> u32 {
        self.acked.len() as u32
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    pub fn retransmitted(&self) -> u64 {
        self.retransmitted
    }

    pub fn pong_received(&self) -> bool {
        self.state != UploadState::AwaitingPong
    }

    /// Chunks sent but not yet acknowledged.
    pub fn outstanding(&self) -> u32 {
        self.next_chunk_to_send.saturating_sub(self.acked.len() as u32)
    }

    pub fn is_complete(&self) -> bool {
        self.acked.len() == self.chunks.len()
    }

    pub fn progress(&self) -> u8 {
        if self.chunks.is_empty() {
            return 100;
        }
        ((self.acked.len() * 100) / self.chunks.len()) as u8
    }

    /// Returns true when this PONG moved the session out of discovery.
    pub fn on_pong(&mut self, now: DateTime<Utc>) -> bool {
        if self.state != UploadState::AwaitingPong {
            return false;
        }
        self.state = UploadState::SendingManifest;
        self.last_activity = now;
        true
    }

    /// Returns true for the first ACK of a sent chunk; duplicates and bogus indices are no-ops.
    pub fn on_ack(&mut self, seq: u32, now: DateTime<Utc>) -> bool {
        if seq >= self.next_chunk_to_send || !self.acked.insert(seq) {
            return false;
        }
        self.window.on_ack();
        self.last_activity = now;
        true
    }

    pub fn step(&mut self, now: DateTime<Utc>, tuning: &FimeshTuning) -> UploadStep {
        if self.state == UploadState::AwaitingPong {
            if now - self.start_time >= tuning.pong_timeout {
                return UploadStep::Fail(UploadFailure::NoPong);
            }
            return UploadStep::Wait;
        }
        if now - self.start_time > tuning.total_timeout {
            return UploadStep::Fail(UploadFailure::TotalTimeout);
        }
        if self.state == UploadState::SendingManifest {
            self.state = UploadState::Transferring;
            self.last_activity = now;
            return UploadStep::SendManifest(self.manifest_frames.clone());
        }
        if self.is_complete() {
            return UploadStep::Complete;
        }
        if now - self.last_activity > self.current_timeout {
            self.retry_count += 1;
            if self.retry_count > tuning.max_retries {
                return UploadStep::Fail(UploadFailure::RetriesExhausted);
            }
            let grown = self.current_timeout * tuning.backoff_factor as i32;
            self.current_timeout = grown.min(tuning.max_timeout);
            self.window.on_retransmit();
            self.last_activity = now;

            let mut frames = Vec::new();
            // Nothing acknowledged yet: the manifest may have been lost too
            if self.acked.is_empty() {
                frames.extend(self.manifest_frames.iter().cloned());
            }
            // Oldest unacked chunks first, no more than the shrunken window
            let unacked: Vec<u32> = (0..self.next_chunk_to_send)
                .filter(|i| !self.acked.contains(i))
                .take(self.window.size() as usize)
                .collect();
            self.retransmitted += unacked.len() as u64;
            frames.extend(unacked.into_iter().map(|i| self.data_frame(i)));
            return UploadStep::Retransmit(frames);
        }

        let frames = self.fill_window();
        if frames.is_empty() {
            UploadStep::Wait
        } else {
            UploadStep::Send(frames)
        }
    }

    fn fill_window(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while (self.next_chunk_to_send as usize) < self.chunks.len()
            && self.outstanding() < self.window.size()
        {
            frames.push(self.data_frame(self.next_chunk_to_send));
            self.next_chunk_to_send += 1;
        }
        frames
    }

    fn data_frame(&self, idx: u32) -> Frame {
        Frame::new(
            self.session_id.clone(),
            Packet::Data {
                seq: idx,
                payload: codec::encode_payload(&self.chunks[idx as usize]),
            },
        )
    }
}
