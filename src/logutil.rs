//! Logging helpers. Caller-supplied text (usernames, subjects, script
//! arguments) and raw wire bytes both end up in log lines; these keep every
//! record on a single line.

/// Escape a string for single-line logging:
/// - `\n` => `\\n`, `\r` => `\\r`, `\t` => `\\t`, backslash => `\\\\`
/// - other control characters become `\xNN`
///
/// Long strings are truncated with an ellipsis to cap log noise.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 200;
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

/// Short hex preview of a wire buffer for protocol trace logging, e.g.
/// `01 01 FE 68 65 6C .. (133 bytes)`.
pub fn hex_preview(data: &[u8]) -> String {
    const MAX_BYTES: usize = 16;
    let mut out = String::with_capacity(MAX_BYTES * 3 + 16);
    for (i, b) in data.iter().take(MAX_BYTES).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02X}", b);
    }
    if data.len() > MAX_BYTES {
        use std::fmt::Write;
        let _ = write!(&mut out, " .. ({} bytes)", data.len());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines() {
        assert_eq!(escape_log("a\nb\r\tc"), "a\\nb\\r\\tc");
    }

    #[test]
    fn escapes_kludge_soh_as_hex() {
        assert_eq!(escape_log("\x01AREA:TEST"), "\\x01AREA:TEST");
    }

    #[test]
    fn hex_preview_truncates() {
        let data: Vec<u8> = (0..32).collect();
        let p = hex_preview(&data);
        assert!(p.starts_with("00 01 02"));
        assert!(p.ends_with("(32 bytes)"));
        assert_eq!(hex_preview(&[0x01, 0xFE]), "01 FE");
    }
}
