//! Outbox file naming and inbox path safety.
//!
//! Outbox files carry their target in the name: `<name>___<hex_node_id>.<ext>`. A file
//! that failed permanently gets `___failed` appended and is ignored from then on.

use std::path::{Path, PathBuf};

use crate::meshtastic::parse_hex_node_id;

const ROUTE_SEPARATOR: &str = "___";
const FAILED_MARKER: &str = "failed";
const MAX_NAME_LEN: usize = 100;
const FALLBACK_NAME: &str = "received.bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxTarget {
    Node(u32),
    /// Marked failed by an earlier attempt
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Name announced to the receiver (routing suffix removed)
    pub transfer_name: String,
    pub target: OutboxTarget,
}

/// Parse an outbox file name. `None` when it has no usable routing suffix.
pub fn parse_outbox_name(file_name: &str) -> Option<OutboxEntry> {
    let (base, route) = file_name.rsplit_once(ROUTE_SEPARATOR)?;
    let (node_part, ext) = match route.split_once('.') {
        Some((node, ext)) => (node, Some(ext)),
        None => (route, None),
    };
    if node_part == FAILED_MARKER {
        return Some(OutboxEntry {
            transfer_name: base.to_string(),
            target: OutboxTarget::Failed,
        });
    }
    let node = parse_hex_node_id(node_part)?;
    if base.is_empty() {
        return None;
    }
    let transfer_name = match ext {
        Some(ext) if !ext.is_empty() => format!("{}.{}", base, ext),
        _ => base.to_string(),
    };
    Some(OutboxEntry {
        transfer_name,
        target: OutboxTarget::Node(node),
    })
}

/// Outbox name for sending `file_name` to `node`.
pub fn outbox_name(file_name: &str, node: u32) -> String {
    let clean = sanitize_file_name(file_name);
    match clean.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}{}{:08x}.{}", stem, ROUTE_SEPARATOR, node, ext),
        _ => format!("{}{}{:08x}", clean, ROUTE_SEPARATOR, node),
    }
}

pub fn failed_name(file_name: &str) -> String {
    format!("{}{}{}", file_name, ROUTE_SEPARATOR, FAILED_MARKER)
}

/// Reduce a received name to one safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or("");
    let mut clean: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    clean = clean.trim_start_matches('.').to_string();
    if clean.len() > MAX_NAME_LEN {
        clean.truncate(MAX_NAME_LEN);
    }
    let stem = clean.split('.').next().unwrap_or("").to_ascii_lowercase();
    if matches!(
        stem.as_str(),
        "con" | "prn" | "aux" | "nul" | "com1" | "com2" | "com3" | "com4" | "lpt1" | "lpt2" | "lpt3"
    ) {
        clean = format!("_{}", clean);
    }
    if clean.is_empty() || clean.chars().all(|c| c == '_') {
        return FALLBACK_NAME.to_string();
    }
    clean
}

/// `dir/name`, or `dir/stem-N.ext` for the first N that does not exist yet.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, Some(e)),
        _ => (name, None),
    };
    let mut n = 1u32;
    loop {
        let next = match ext {
            Some(e) => format!("{}-{}.{}", stem, n, e),
            None => format!("{}-{}", stem, n),
        };
        let path = dir.join(next);
        if !path.exists() {
            return path;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_suffix_is_parsed_and_stripped() {
        assert_eq!(
            parse_outbox_name("report___a1b2c3d4.txt"),
            Some(OutboxEntry {
                transfer_name: "report.txt".into(),
                target: OutboxTarget::Node(0xa1b2c3d4)
            })
        );
        assert_eq!(
            parse_outbox_name("my___file___0000beef"),
            Some(OutboxEntry {
                transfer_name: "my___file".into(),
                target: OutboxTarget::Node(0xbeef)
            })
        );
        assert_eq!(
            parse_outbox_name("photo___1000.jpg"),
            Some(OutboxEntry {
                transfer_name: "photo.jpg".into(),
                target: OutboxTarget::Node(0x1000)
            })
        );
        assert_eq!(parse_outbox_name("plain.txt"), None);
        assert_eq!(parse_outbox_name("x___zzzz.txt"), None);
    }

    #[test]
    fn failed_marker_is_recognised() {
        let failed = failed_name("report___a1b2c3d4.txt");
        assert_eq!(failed, "report___a1b2c3d4.txt___failed");
        assert_eq!(parse_outbox_name(&failed).map(|e| e.target), Some(OutboxTarget::Failed));
    }

    #[test]
    fn outbox_name_round_trips() {
        let name = outbox_name("log.tar.gz", 0x1234);
        assert_eq!(name, "log.tar___00001234.gz");
        let entry = parse_outbox_name(&name).unwrap();
        assert_eq!(entry.target, OutboxTarget::Node(0x1234));
        assert_eq!(entry.transfer_name, "log.tar.gz");
        assert_eq!(outbox_name("README", 0xff), "README___000000ff");
    }

    #[test]
    fn sanitizer_blocks_traversal() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("..\\boot.ini"), "boot.ini");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name("a b?.txt"), "a_b_.txt");
        assert_eq!(sanitize_file_name("nul.txt"), "_nul.txt");
        assert_eq!(sanitize_file_name(""), FALLBACK_NAME);
        assert_eq!(sanitize_file_name("???"), FALLBACK_NAME);
    }

    #[test]
    fn unique_path_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_path(dir.path(), "a.txt");
        std::fs::write(&first, b"1").unwrap();
        let second = unique_path(dir.path(), "a.txt");
        assert_eq!(second.file_name().unwrap(), "a-1.txt");
    }
}
