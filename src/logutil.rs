//! Logging helpers that keep radio traffic readable on a single log line.
//!
//! Chat texts may contain newlines and FiMesh frames carry long base64 payloads; both are
//! escaped and abbreviated before they reach the log.

use std::fmt::Write;

const MAX_PREVIEW: usize = 120;
const PAYLOAD_KEEP: usize = 12;

/// Escape control characters and cap length:
/// - `\n` => `\\n`, `\r` => `\\r`, `\t` => `\\t`, backslash => `\\\\`
/// - other control chars => `\xNN`
/// - anything past `max_chars` is replaced by an ellipsis
pub fn escape_log(s: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max_chars) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= max_chars {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Preview of an outgoing or incoming text for logs.
///
/// FiMesh frames keep their header fields and show only the start of the payload plus
/// its length, e.g. `fmsh:1a2b3c4d:DAT:0003:eJzLSM3JyQcA…(188b)`.
pub fn preview_frame(text: &str) -> String {
    if text.starts_with("fmsh:") {
        let header_end = match text.split(':').nth(2) {
            Some("MAN") => nth_colon(text, 5),
            Some(_) => nth_colon(text, 4),
            None => None,
        };
        if let Some(idx) = header_end {
            let (header, payload) = text.split_at(idx + 1);
            if payload.chars().count() > PAYLOAD_KEEP {
                let head: String = payload.chars().take(PAYLOAD_KEEP).collect();
                return format!(
                    "{}{}…({}b)",
                    escape_log(header, MAX_PREVIEW),
                    escape_log(&head, PAYLOAD_KEEP),
                    text.len()
                );
            }
        }
    }
    escape_log(text, MAX_PREVIEW)
}

fn nth_colon(text: &str, n: usize) -> Option<usize> {
    text.match_indices(':').nth(n - 1).map(|(i, _)| i)
}
