//! Transfer manifest: file name, original size and one digest per chunk.
//!
//! Text form, before packing:
//!
//! ```text
//! report.txt
//! 1000
//! 0000:5d41402abc4b2a76b9719d911017c592
//! 0001:7d793037a0760186574b0282f2f435e7
//! ```
//!
//! The whole text is packed (zlib + base64) and the resulting ASCII blob is cut into
//! segments. A segment is not decodable on its own; the receiver concatenates them by
//! sequence number once the last one is known.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::codec::{self, chunk_digest, CodecError, Frame, Packet};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest blob: {0}")]
    Codec(#[from] CodecError),
    #[error("manifest is not valid UTF-8")]
    Utf8,
    #[error("manifest has no file name")]
    MissingName,
    #[error("invalid file size '{0}'")]
    BadSize(String),
    #[error("invalid chunk line '{0}'")]
    BadLine(String),
    #[error("chunk {0} listed twice")]
    DuplicateIndex(u32),
    #[error("manifest lists no chunks")]
    NoChunks,
    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("manifest lists {count} chunks, limit is {limit}")]
    TooManyChunks { count: u32, limit: u32 },
}

/// Upper bound on the manifest text for `max_chunks` chunk lines.
pub fn text_limit(max_chunks: u32) -> u64 {
    u64::from(max_chunks) * 48 + 1024
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub file_name: String,
    pub file_size: u64,
    pub chunk_hashes: BTreeMap<u32, String>,
}

impl Manifest {
    pub fn for_chunks(file_name: &str, file_size: u64, chunks: &[Vec<u8>]) -> Self {
        let chunk_hashes = chunks
            .iter()
            .enumerate()
            .map(|(idx, chunk)| (idx as u32, chunk_digest(chunk)))
            .collect();
        Self {
            file_name: file_name.replace(['\n', '\r'], "_"),
            file_size,
            chunk_hashes,
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = format!("{}\n{}\n", self.file_name, self.file_size);
        for (idx, digest) in &self.chunk_hashes {
            out.push_str(&format!("{:04x}:{}\n", idx, digest));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut lines = text.lines();
        let file_name = match lines.next() {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => return Err(ManifestError::MissingName),
        };
        let size_line = lines.next().unwrap_or("");
        let file_size = size_line
            .trim()
            .parse::<u64>()
            .map_err(|_| ManifestError::BadSize(size_line.to_string()))?;

        let mut chunk_hashes = BTreeMap::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (idx, digest) = line
                .split_once(':')
                .ok_or_else(|| ManifestError::BadLine(line.to_string()))?;
            let idx = u32::from_str_radix(idx, 16).map_err(|_| ManifestError::BadLine(line.to_string()))?;
            if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ManifestError::BadLine(line.to_string()));
            }
            if chunk_hashes.insert(idx, digest.to_ascii_lowercase()).is_some() {
                return Err(ManifestError::DuplicateIndex(idx));
            }
        }
        if chunk_hashes.is_empty() {
            return Err(ManifestError::NoChunks);
        }
        Ok(Self {
            file_name,
            file_size,
            chunk_hashes,
        })
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunk_hashes.len() as u32
    }

    /// Pack and split into MAN frames; exactly the final frame carries `is_last`.
    pub fn to_frames(&self, session_id: &str, segment_size: usize) -> Result<Vec<Frame>, CodecError> {
        let blob = codec::pack_blob(self.to_text().as_bytes())?;
        let segments = codec::split_ascii(&blob, segment_size);
        let last = segments.len().saturating_sub(1);
        Ok(segments
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                Frame::new(
                    session_id,
                    Packet::Manifest {
                        seq: i as u32,
                        is_last: i == last,
                        payload,
                    },
                )
            })
            .collect())
    }

    pub fn from_blob(blob: &str, max_text: u64) -> Result<Self, ManifestError> {
        let bytes = codec::unpack_blob(blob, max_text)?;
        let text = String::from_utf8(bytes).map_err(|_| ManifestError::Utf8)?;
        Self::parse(&text)
    }
}

/// Collects manifest segments in any order.
#[derive(Debug, Default, Clone)]
pub struct SegmentBuffer {
    segments: BTreeMap<u32, String>,
    last_seq: Option<u32>,
}

impl SegmentBuffer {
    pub fn push(&mut self, seq: u32, is_last: bool, payload: &str) {
        self.segments.entry(seq).or_insert_with(|| payload.to_string());
        if is_last {
            self.last_seq = Some(seq);
        }
    }

    pub fn has_last(&self) -> bool {
        self.last_seq.is_some()
    }

    /// Every segment up to and including the flagged last one has arrived.
    pub fn is_complete(&self) -> bool {
        match self.last_seq {
            Some(last) => (0..=last).all(|seq| self.segments.contains_key(&seq)),
            None => false,
        }
    }

    /// Concatenate by sequence number, never by arrival order.
    pub fn concat(&self) -> Option<String> {
        let last = self.last_seq?;
        if !self.is_complete() {
            return None;
        }
        Some(
            self.segments
                .range(0..=last)
                .map(|(_, s)| s.as_str())
                .collect::<String>(),
        )
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(chunks: usize) -> Manifest {
        let data: Vec<Vec<u8>> = (0..chunks).map(|i| vec![i as u8; 140]).collect();
        Manifest::for_chunks("notes.txt", 12345, &data)
    }

    #[test]
    fn text_form_parses_back() {
        let m = sample(3);
        let text = m.to_text();
        assert!(text.starts_with("notes.txt\n12345\n0000:"));
        assert_eq!(Manifest::parse(&text).unwrap(), m);
    }

    #[test]
    fn malformed_manifests_are_rejected() {
        assert_eq!(Manifest::parse(""), Err(ManifestError::MissingName));
        assert!(matches!(Manifest::parse("a\nxx\n"), Err(ManifestError::BadSize(_))));
        assert_eq!(Manifest::parse("a\n10\n"), Err(ManifestError::NoChunks));
        assert!(matches!(Manifest::parse("a\n10\n0000\n"), Err(ManifestError::BadLine(_))));
        assert_eq!(
            Manifest::parse("a\n10\n0000:ab\n0000:cd\n"),
            Err(ManifestError::DuplicateIndex(0))
        );
    }

    #[test]
    fn segments_reassemble_in_any_arrival_order() {
        let m = sample(40);
        let frames = m.to_frames("cafe0001", 20).unwrap();
        assert!(frames.len() > 3);
        let flagged = frames
            .iter()
            .filter(|f| matches!(f.packet, Packet::Manifest { is_last: true, .. }))
            .count();
        assert_eq!(flagged, 1);

        // Deliver last segment first, then the rest reversed
        let mut buffer = SegmentBuffer::default();
        for frame in frames.iter().rev() {
            assert!(!buffer.is_complete());
            if let Packet::Manifest { seq, is_last, payload } = &frame.packet {
                buffer.push(*seq, *is_last, payload);
            }
        }
        assert!(buffer.is_complete());
        assert_eq!(Manifest::from_blob(&buffer.concat().unwrap(), text_limit(40)).unwrap(), m);
    }

    #[test]
    fn incomplete_buffer_does_not_concat() {
        let mut buffer = SegmentBuffer::default();
        buffer.push(2, true, "cc");
        buffer.push(0, false, "aa");
        assert!(buffer.has_last());
        assert!(buffer.concat().is_none());
        buffer.push(1, false, "bb");
        assert_eq!(buffer.concat().as_deref(), Some("aabbcc"));
    }
}
