//! # Packet Codec
//!
//! FiMesh frames are plain ASCII so they can ride inside an ordinary mesh text message:
//!
//! ```text
//! fmsh:<session_id>:<TYPE>:<seq_hex>:<payload>
//! fmsh:<session_id>:MAN:<seq_hex>:<is_last>:<payload>
//! ```
//!
//! Binary data is zlib-compressed and base64-encoded before it is placed in a payload.
//! Decoding never panics and never hands a half-parsed frame downstream: callers get
//! either a [`Frame`] or a [`CodecError`] describing why the text was not one.
//!
//! The module also carries the generic chat-text chunker used by the delivery layer,
//! which is unrelated to FiMesh chunking but shares the same size discipline.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::io::{Read, Write};
use thiserror::Error;

pub const FRAME_PREFIX: &str = "fmsh";

/// Largest number of encoded payload bytes carried by one frame.
pub const MAX_CHUNK_PAYLOAD: usize = 140;

/// Smallest chunk size a sender may configure.
pub const MIN_CHUNK_PAYLOAD: usize = 16;

const MAX_SESSION_ID_LEN: usize = 32;

/// One FiMesh packet body, exhaustively matched by the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ping,
    Pong,
    Manifest {
        seq: u32,
        is_last: bool,
        payload: String,
    },
    Data {
        seq: u32,
        payload: String,
    },
    Ack {
        seq: u32,
    },
}

impl Packet {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Packet::Ping => "PING",
            Packet::Pong => "PONG",
            Packet::Manifest { .. } => "MAN",
            Packet::Data { .. } => "DAT",
            Packet::Ack { .. } => "ACK",
        }
    }
}

/// A packet bound to its transfer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub session_id: String,
    pub packet: Packet,
}

impl Frame {
    pub fn new(session_id: impl Into<String>, packet: Packet) -> Self {
        Self {
            session_id: session_id.into(),
            packet,
        }
    }

    /// Serialize to the on-air text form.
    pub fn encode(&self) -> String {
        let sid = &self.session_id;
        match &self.packet {
            Packet::Ping => format!("{FRAME_PREFIX}:{sid}:PING:0000:PING"),
            Packet::Pong => format!("{FRAME_PREFIX}:{sid}:PONG:0000:PONG"),
            Packet::Manifest {
                seq,
                is_last,
                payload,
            } => format!(
                "{FRAME_PREFIX}:{sid}:MAN:{:04x}:{}:{}",
                seq,
                if *is_last { '1' } else { '0' },
                payload
            ),
            Packet::Data { seq, payload } => {
                format!("{FRAME_PREFIX}:{sid}:DAT:{:04x}:{}", seq, payload)
            }
            Packet::Ack { seq } => format!("{FRAME_PREFIX}:{sid}:ACK:{:04x}:ACK", seq),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("not a fimesh frame")]
    NotFimesh,
    #[error("too few fields ({0})")]
    TooFewFields(usize),
    #[error("invalid session id '{0}'")]
    BadSession(String),
    #[error("unknown packet type '{0}'")]
    UnknownType(String),
    #[error("invalid sequence field '{0}'")]
    BadSequence(String),
    #[error("invalid is_last flag '{0}'")]
    BadFlag(String),
    #[error("empty payload in {0} frame")]
    EmptyPayload(&'static str),
    #[error("payload is not valid base64")]
    BadBase64,
    #[error("payload failed to inflate: {0}")]
    Inflate(String),
    #[error("payload inflates past {0} bytes")]
    TooLong(u64),
    #[error("compression failed: {0}")]
    Deflate(String),
}

/// Cheap check used by inbound routing before a full parse.
pub fn is_fimesh(text: &str) -> bool {
    text.starts_with("fmsh:")
}

/// Parse one frame. Text that merely starts with `fmsh:` but is malformed yields a
/// descriptive error; callers log and drop it.
pub fn parse_frame(text: &str) -> Result<Frame, CodecError> {
    let text = text.trim_end_matches(['\r', '\n']);
    let parts: Vec<&str> = text.splitn(6, ':').collect();
    if parts.first() != Some(&FRAME_PREFIX) {
        return Err(CodecError::NotFimesh);
    }
    if parts.len() < 4 {
        return Err(CodecError::TooFewFields(parts.len()));
    }
    let session_id = parts[1];
    if session_id.is_empty()
        || session_id.len() > MAX_SESSION_ID_LEN
        || !session_id.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(CodecError::BadSession(session_id.to_string()));
    }
    let seq = parse_seq(parts[3])?;
    // Everything after the sequence field (re-joined, payloads never contain ':' but be lenient)
    let tail: Vec<&str> = parts[4..].to_vec();

    let packet = match parts[2] {
        "PING" => Packet::Ping,
        "PONG" => Packet::Pong,
        "ACK" => Packet::Ack { seq },
        "DAT" => {
            let payload = tail.join(":");
            if payload.trim().is_empty() {
                return Err(CodecError::EmptyPayload("DAT"));
            }
            Packet::Data { seq, payload }
        }
        "MAN" => {
            if tail.len() < 2 {
                return Err(CodecError::TooFewFields(parts.len()));
            }
            let is_last = match tail[0] {
                "1" => true,
                "0" => false,
                other => return Err(CodecError::BadFlag(other.to_string())),
            };
            let payload = tail[1..].join(":");
            if payload.trim().is_empty() {
                return Err(CodecError::EmptyPayload("MAN"));
            }
            Packet::Manifest {
                seq,
                is_last,
                payload,
            }
        }
        other => return Err(CodecError::UnknownType(other.to_string())),
    };

    Ok(Frame {
        session_id: session_id.to_string(),
        packet,
    })
}

fn parse_seq(field: &str) -> Result<u32, CodecError> {
    let trimmed = field.trim();
    if trimmed.is_empty() || trimmed.len() > 8 {
        return Err(CodecError::BadSequence(field.to_string()));
    }
    u32::from_str_radix(trimmed, 16).map_err(|_| CodecError::BadSequence(field.to_string()))
}

/// zlib-compress a buffer.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::best());
    encoder
        .write_all(data)
        .map_err(|e| CodecError::Deflate(e.to_string()))?;
    encoder.finish().map_err(|e| CodecError::Deflate(e.to_string()))
}

/// Inflate at most `limit + 1` bytes: enough to see that the output is too long
/// without expanding all of it.
pub fn decompress_limited(data: &[u8], limit: u64) -> Result<Vec<u8>, CodecError> {
    let mut decoder = ZlibDecoder::new(data).take(limit.saturating_add(1));
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Inflate(e.to_string()))?;
    Ok(out)
}

pub fn encode_payload(data: &[u8]) -> String {
    B64.encode(data)
}

pub fn decode_payload(payload: &str) -> Result<Vec<u8>, CodecError> {
    B64.decode(payload.trim()).map_err(|_| CodecError::BadBase64)
}

/// Compress then base64 a blob (manifest bodies).
pub fn pack_blob(data: &[u8]) -> Result<String, CodecError> {
    Ok(encode_payload(&compress(data)?))
}

/// Reverse of [`pack_blob`]; blobs that inflate past `limit` bytes are refused.
pub fn unpack_blob(payload: &str, limit: u64) -> Result<Vec<u8>, CodecError> {
    let out = decompress_limited(&decode_payload(payload)?, limit)?;
    if out.len() as u64 > limit {
        return Err(CodecError::TooLong(limit));
    }
    Ok(out)
}

/// Split bytes into fixed-size slices (last one may be shorter).
pub fn split_bytes(data: &[u8], size: usize) -> Vec<Vec<u8>> {
    let size = size.max(1);
    data.chunks(size).map(|c| c.to_vec()).collect()
}

/// Split an ASCII string (base64 output) into fixed-size segments.
pub fn split_ascii(text: &str, size: usize) -> Vec<String> {
    split_bytes(text.as_bytes(), size)
        .into_iter()
        .map(|seg| String::from_utf8_lossy(&seg).into_owned())
        .collect()
}

/// Corruption detector for one chunk: the first 128 bits of SHA-256, hex encoded.
pub fn chunk_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}

/// Chunk a chat text into pieces of at most `max_bytes` bytes.
///
/// Splits at the last space inside the limit when there is one, otherwise at the last
/// UTF-8 boundary. Continuation chunks have their leading whitespace trimmed.
pub fn chunk_text(text: &str, max_bytes: usize) -> Vec<String> {
    let max_bytes = max_bytes.max(4);
    if text.len() <= max_bytes {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_bytes {
            chunks.push(remaining.to_string());
            break;
        }
        let mut end = max_bytes;
        while end > 0 && !remaining.is_char_boundary(end) {
            end -= 1;
        }
        let split = match remaining[..end].rfind(' ') {
            Some(pos) if pos > 0 => pos,
            _ => end,
        };
        chunks.push(remaining[..split].to_string());
        remaining = remaining[split..].trim_start();
    }
    chunks
}
