//! Logging helpers that keep device strings on a single log line.
//! Message bodies and contact names come straight off the radio and may carry
//! newlines or control bytes; run them through these before formatting.

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///
/// Strings longer than 300 characters are cut with an ellipsis.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Cut `s` to at most `max` bytes on a char boundary, appending `…` when cut.
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// First 12 hex characters of a public key; enough to identify a node in logs.
pub fn short_key(key: &str) -> &str {
    match key.char_indices().nth(12) {
        Some((idx, _)) => &key[..idx],
        None => key,
    }
}

/// Hex preview of a raw frame, capped at `max` bytes.
pub fn hex_snippet(bytes: &[u8], max: usize) -> String {
    let take = bytes.len().min(max);
    let mut out = hex::encode(&bytes[..take]);
    if bytes.len() > take {
        out.push_str(&format!("…(+{})", bytes.len() - take));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_tabs() {
        let s = "Line1\nLine2\r\tEnd";
        assert_eq!(escape_log(s), "Line1\\nLine2\\r\\tEnd");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_for_log("héllo", 2), "h…");
        assert_eq!(truncate_for_log("short", 10), "short");
    }

    #[test]
    fn short_key_takes_prefix() {
        let key = "a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90";
        assert_eq!(short_key(key), "a1b2c3d4e5f6");
        assert_eq!(short_key("abc"), "abc");
    }

    #[test]
    fn hex_snippet_marks_overflow() {
        assert_eq!(hex_snippet(&[0x3e, 0x01, 0x00], 8), "3e0100");
        assert_eq!(hex_snippet(&[1, 2, 3, 4], 2), "0102…(+2)");
    }
}
