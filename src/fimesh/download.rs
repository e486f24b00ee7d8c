//! Downloader side of a transfer: manifest collection, chunk storage, verified assembly.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use super::manifest::{self, Manifest, ManifestError, SegmentBuffer};
use super::FimeshTuning;
use crate::codec::{self, chunk_digest, CodecError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    CollectingManifest,
    ReceivingChunks,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("digest mismatch for chunks {0:?}")]
    HashMismatch(Vec<u32>),
    #[error("assembled data failed to inflate: {0}")]
    Inflate(CodecError),
    #[error("assembled size {actual} does not match manifest size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("{0}")]
    Payload(#[from] CodecError),
    #[error("chunk {0} is not listed in the manifest")]
    Unexpected(u32),
    #[error("already holding {0} chunks without a manifest")]
    TooMany(u32),
}

/// What a download is willing to accept from its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadLimits {
    pub max_file_bytes: u64,
    pub max_chunks: u32,
}

impl DownloadLimits {
    /// Chunk ceiling assumes the smallest chunk size a sender may use, plus zlib overhead.
    pub fn from_tuning(tuning: &FimeshTuning) -> Self {
        let compressed_bound = tuning
            .max_file_bytes
            .saturating_add(tuning.max_file_bytes / 1000)
            .saturating_add(64);
        let max_chunks = compressed_bound.div_ceil(codec::MIN_CHUNK_PAYLOAD as u64);
        Self {
            max_file_bytes: tuning.max_file_bytes,
            max_chunks: u32::try_from(max_chunks).unwrap_or(u32::MAX),
        }
    }
}

impl Default for DownloadLimits {
    fn default() -> Self {
        Self::from_tuning(&FimeshTuning::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadTimeout {
    Idle,
    Total,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStep {
    Wait,
    Assemble,
    TimedOut(DownloadTimeout),
}

#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub session_id: String,
    pub peer: u32,
    manifest: Option<Manifest>,
    segments: SegmentBuffer,
    received: BTreeMap<u32, Vec<u8>>,
    expected: BTreeSet<u32>,
    start_time: DateTime<Utc>,
    last_packet_time: DateTime<Utc>,
    state: DownloadState,
    limits: DownloadLimits,
}

impl DownloadSession {
    pub fn new(session_id: impl Into<String>, peer: u32, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            peer,
            manifest: None,
            segments: SegmentBuffer::default(),
            received: BTreeMap::new(),
            expected: BTreeSet::new(),
            start_time: now,
            last_packet_time: now,
            state: DownloadState::CollectingManifest,
            limits: DownloadLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: DownloadLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn expected_count(&self) -> usize {
        self.expected.len()
    }

    pub fn progress(&self) -> u8 {
        if self.expected.is_empty() {
            return 0;
        }
        let have = self.expected.iter().filter(|i| self.received.contains_key(i)).count();
        ((have * 100) / self.expected.len()) as u8
    }

    /// Buffer one manifest segment. Returns the manifest once it has just been completed.
    pub fn on_manifest_segment(
        &mut self,
        seq: u32,
        is_last: bool,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<&Manifest>, ManifestError> {
        self.last_packet_time = now;
        if self.manifest.is_some() {
            return Ok(None);
        }
        self.segments.push(seq, is_last, payload);
        let blob = match self.segments.concat() {
            Some(blob) => blob,
            None => return Ok(None),
        };
        let manifest = Manifest::from_blob(&blob, manifest::text_limit(self.limits.max_chunks))?;
        if manifest.file_size > self.limits.max_file_bytes {
            return Err(ManifestError::TooLarge {
                size: manifest.file_size,
                limit: self.limits.max_file_bytes,
            });
        }
        if manifest.total_chunks() > self.limits.max_chunks {
            return Err(ManifestError::TooManyChunks {
                count: manifest.total_chunks(),
                limit: self.limits.max_chunks,
            });
        }
        self.expected = manifest.chunk_hashes.keys().copied().collect();
        let expected = &self.expected;
        self.received.retain(|idx, _| expected.contains(idx));
        self.state = DownloadState::ReceivingChunks;
        self.manifest = Some(manifest);
        Ok(self.manifest.as_ref())
    }

    /// Store a DAT payload keyed by index, whatever the arrival order. Once the manifest
    /// is known only the chunks it lists are accepted.
    pub fn on_data(&mut self, seq: u32, payload: &str, now: DateTime<Utc>) -> Result<(), ChunkError> {
        if self.manifest.is_some() {
            if !self.expected.contains(&seq) {
                return Err(ChunkError::Unexpected(seq));
            }
        } else if !self.received.contains_key(&seq) && self.received.len() as u32 >= self.limits.max_chunks {
            return Err(ChunkError::TooMany(self.limits.max_chunks));
        }
        let bytes = codec::decode_payload(payload)?;
        self.received.insert(seq, bytes);
        self.last_packet_time = now;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.manifest.is_some()
            && !self.expected.is_empty()
            && self.expected.iter().all(|i| self.received.contains_key(i))
    }

    pub fn step(&self, now: DateTime<Utc>, tuning: &FimeshTuning) -> DownloadStep {
        if now - self.start_time > tuning.download_total_timeout {
            return DownloadStep::TimedOut(DownloadTimeout::Total);
        }
        if self.is_ready() {
            return DownloadStep::Assemble;
        }
        if now - self.last_packet_time > tuning.download_idle_timeout {
            return DownloadStep::TimedOut(DownloadTimeout::Idle);
        }
        DownloadStep::Wait
    }

    /// Verify every chunk and return the original file bytes.
    ///
    /// On a digest mismatch the offending chunks are discarded so that retransmitted
    /// copies can replace them; nothing is assembled.
    pub fn assemble(&mut self) -> Result<Vec<u8>, AssemblyError> {
        let manifest = match &self.manifest {
            Some(m) => m,
            None => return Err(AssemblyError::HashMismatch(Vec::new())),
        };
        let bad: Vec<u32> = self
            .expected
            .iter()
            .copied()
            .filter(|idx| match (self.received.get(idx), manifest.chunk_hashes.get(idx)) {
                (Some(bytes), Some(digest)) => chunk_digest(bytes) != *digest,
                _ => true,
            })
            .collect();
        if !bad.is_empty() {
            for idx in &bad {
                self.received.remove(idx);
            }
            return Err(AssemblyError::HashMismatch(bad));
        }

        let mut compressed = Vec::new();
        for idx in &self.expected {
            if let Some(bytes) = self.received.get(idx) {
                compressed.extend_from_slice(bytes);
            }
        }
        let data = codec::decompress_limited(&compressed, manifest.file_size).map_err(AssemblyError::Inflate)?;
        if data.len() as u64 != manifest.file_size {
            return Err(AssemblyError::SizeMismatch {
                expected: manifest.file_size,
                actual: data.len() as u64,
            });
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Frame, Packet};
    use chrono::Duration;

    fn prepared(data: &[u8], chunk: usize) -> (Vec<Vec<u8>>, Vec<Frame>) {
        let chunks = codec::split_bytes(&codec::compress(data).unwrap(), chunk);
        let manifest = Manifest::for_chunks("f.bin", data.len() as u64, &chunks);
        (chunks, manifest.to_frames("feed0001", chunk).unwrap())
    }

    fn feed_manifest(s: &mut DownloadSession, frames: &[Frame], now: DateTime<Utc>) {
        for f in frames {
            if let Packet::Manifest { seq, is_last, payload } = &f.packet {
                s.on_manifest_segment(*seq, *is_last, payload, now).unwrap();
            }
        }
    }

    #[test]
    fn out_of_order_chunks_assemble() {
        let data = b"mesh radio file transfer ".repeat(80);
        let (chunks, frames) = prepared(&data, 16);
        let now = Utc::now();
        let mut s = DownloadSession::new("feed0001", 9, now);
        feed_manifest(&mut s, &frames, now);
        assert_eq!(s.state(), DownloadState::ReceivingChunks);
        for (i, c) in chunks.iter().enumerate().rev() {
            s.on_data(i as u32, &codec::encode_payload(c), now).unwrap();
        }
        assert_eq!(s.step(now, &FimeshTuning::default()), DownloadStep::Assemble);
        assert_eq!(s.assemble().unwrap(), data);
    }

    #[test]
    fn corrupted_chunk_blocks_assembly() {
        let data: Vec<u8> = (0..3000u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
        let (mut chunks, frames) = prepared(&data, 140);
        let now = Utc::now();
        let mut s = DownloadSession::new("feed0001", 9, now);
        feed_manifest(&mut s, &frames, now);
        chunks[1][0] ^= 0xff;
        for (i, c) in chunks.iter().enumerate() {
            s.on_data(i as u32, &codec::encode_payload(c), now).unwrap();
        }
        assert!(s.is_ready());
        assert_eq!(s.assemble(), Err(AssemblyError::HashMismatch(vec![1])));
        assert!(!s.is_ready());
        assert!(s.progress() < 100);
    }

    #[test]
    fn chunks_before_manifest_are_kept() {
        let data = b"early bird".repeat(10);
        let (chunks, frames) = prepared(&data, 140);
        let now = Utc::now();
        let mut s = DownloadSession::new("feed0001", 9, now);
        s.on_data(0, &codec::encode_payload(&chunks[0]), now).unwrap();
        assert!(!s.is_ready());
        feed_manifest(&mut s, &frames, now);
        assert!(s.is_ready());
    }

    #[test]
    fn idle_and_total_timeouts() {
        let tuning = FimeshTuning::default();
        let now = Utc::now();
        let s = DownloadSession::new("feed0001", 9, now);
        assert_eq!(s.step(now + Duration::seconds(300), &tuning), DownloadStep::Wait);
        assert_eq!(
            s.step(now + Duration::seconds(301), &tuning),
            DownloadStep::TimedOut(DownloadTimeout::Idle)
        );
        assert_eq!(
            s.step(now + Duration::seconds(1801), &tuning),
            DownloadStep::TimedOut(DownloadTimeout::Total)
        );
    }

    #[test]
    fn bad_base64_is_refused() {
        let now = Utc::now();
        let mut s = DownloadSession::new("feed0001", 9, now);
        assert_eq!(s.on_data(0, "***", now), Err(ChunkError::Payload(CodecError::BadBase64)));
        assert_eq!(s.received_count(), 0);
    }

    #[test]
    fn chunks_outside_the_manifest_are_refused() {
        let data = b"bounded".repeat(40);
        let (chunks, frames) = prepared(&data, 140);
        let now = Utc::now();
        let mut s = DownloadSession::new("feed0001", 9, now);
        // A stray index buffered early is discarded when the manifest lands
        s.on_data(500, &codec::encode_payload(&chunks[0]), now).unwrap();
        feed_manifest(&mut s, &frames, now);
        assert_eq!(s.received_count(), 0);
        assert_eq!(
            s.on_data(0x7fff, &codec::encode_payload(&chunks[0]), now),
            Err(ChunkError::Unexpected(0x7fff))
        );
        s.on_data(0, &codec::encode_payload(&chunks[0]), now).unwrap();
        assert_eq!(s.received_count(), 1);
    }

    #[test]
    fn chunks_before_manifest_are_capped() {
        let now = Utc::now();
        let limits = DownloadLimits {
            max_file_bytes: 1000,
            max_chunks: 2,
        };
        let mut s = DownloadSession::new("feed0001", 9, now).with_limits(limits);
        s.on_data(0, "QUJD", now).unwrap();
        s.on_data(1, "QUJD", now).unwrap();
        s.on_data(1, "QUJD", now).unwrap();
        assert_eq!(s.on_data(2, "QUJD", now), Err(ChunkError::TooMany(2)));
    }

    #[test]
    fn oversized_manifest_is_refused() {
        let data = vec![7u8; 5000];
        let (_, frames) = prepared(&data, 140);
        let now = Utc::now();
        let limits = DownloadLimits {
            max_file_bytes: 4096,
            max_chunks: 100,
        };
        let mut s = DownloadSession::new("feed0001", 9, now).with_limits(limits);
        let mut outcome = Ok(None);
        for f in &frames {
            if let Packet::Manifest { seq, is_last, payload } = &f.packet {
                outcome = s.on_manifest_segment(*seq, *is_last, payload, now).map(|m| m.cloned());
            }
        }
        assert_eq!(outcome, Err(ManifestError::TooLarge { size: 5000, limit: 4096 }));
        assert!(s.manifest().is_none());
    }

    #[test]
    fn inflate_stops_at_the_announced_size() {
        // 100 kB of zeros deflates to a few chunks but claims to be 10 bytes
        let compressed = codec::compress(&vec![0u8; 100_000]).unwrap();
        let chunks = codec::split_bytes(&compressed, 140);
        let manifest = Manifest::for_chunks("bomb.bin", 10, &chunks);
        let now = Utc::now();
        let mut s = DownloadSession::new("feed0001", 9, now);
        feed_manifest(&mut s, &manifest.to_frames("feed0001", 140).unwrap(), now);
        for (i, c) in chunks.iter().enumerate() {
            s.on_data(i as u32, &codec::encode_payload(c), now).unwrap();
        }
        assert_eq!(
            s.assemble(),
            Err(AssemblyError::SizeMismatch {
                expected: 10,
                actual: 11
            })
        );
    }

    #[test]
    fn limits_follow_tuning() {
        let limits = DownloadLimits::from_tuning(&FimeshTuning {
            max_file_bytes: 16_000,
            ..FimeshTuning::default()
        });
        assert_eq!(limits.max_file_bytes, 16_000);
        assert_eq!(limits.max_chunks, 1005);
    }
}
