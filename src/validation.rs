//! Input validation and pattern matching shared across the session runtime
//! and the mail subsystem.

use thiserror::Error;

/// Maximum username length. Usernames are case-insensitively unique; the
/// uniqueness check itself lives in the user registry.
pub const MAX_USERNAME_LEN: usize = 31;

/// Maximum length of the free-text line activity label.
pub const MAX_ACTIVITY_LEN: usize = 96;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsernameError {
    #[error("username is too short (minimum 2 characters)")]
    TooShort,
    #[error("username is too long (maximum {MAX_USERNAME_LEN} characters)")]
    TooLong,
    #[error("username contains invalid characters")]
    InvalidCharacters,
    #[error("username is a reserved name")]
    Reserved,
}

const RESERVED_NAMES: &[&str] = &[
    "all", "sysop", "areafix", "filefix", "areamgr", "filemgr", "raid",
    "filescan", "new", "guest",
];

/// Validate a username for registration. ASCII letters, digits, spaces and
/// `.` `-` `_` are allowed; leading/trailing whitespace is trimmed away.
pub fn validate_username(name: &str) -> Result<String, UsernameError> {
    let trimmed = name.trim();
    if trimmed.len() < 2 {
        return Err(UsernameError::TooShort);
    }
    if trimmed.len() > MAX_USERNAME_LEN {
        return Err(UsernameError::TooLong);
    }
    let ok = trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '.' || c == '-' || c == '_');
    if !ok {
        return Err(UsernameError::InvalidCharacters);
    }
    let lower = trimmed.to_ascii_lowercase();
    if RESERVED_NAMES.contains(&lower.as_str()) {
        return Err(UsernameError::Reserved);
    }
    Ok(trimmed.to_string())
}

/// Reduce an arbitrary announced filename to a safe basename: strips any
/// directory components and replaces bytes outside `[A-Za-z0-9._-]`.
/// Inbound BinkP/ZMODEM names pass through here before touching the disk.
pub fn safe_filename(name: &str) -> String {
    let base = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    // A name of only dots would escape upward.
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Truncate an activity label to its byte budget on a char boundary.
pub fn clamp_activity(text: &str) -> String {
    if text.len() <= MAX_ACTIVITY_LEN {
        return text.to_string();
    }
    let mut end = MAX_ACTIVITY_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Case-insensitive wildcard match with `*` (any run) and `?` (any one
/// char). Used for EchoFix allowed-echo patterns and FREQ name expansion.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                // Greedy star: try to consume zero or more text bytes.
                inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(&pc), Some(&tc)) if pc.eq_ignore_ascii_case(&tc) => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

/// Match against a comma- or space-separated pattern list. An empty list
/// matches nothing; use `*` for "everything".
pub fn wildcard_match_any(patterns: &str, text: &str) -> bool {
    patterns
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .any(|p| wildcard_match(p, text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames_trim_and_validate() {
        assert_eq!(validate_username("  Fernando Alves "), Ok("Fernando Alves".into()));
        assert_eq!(validate_username("x"), Err(UsernameError::TooShort));
        assert_eq!(validate_username("AreaFix"), Err(UsernameError::Reserved));
        assert_eq!(validate_username("bad|name"), Err(UsernameError::InvalidCharacters));
        assert!(validate_username(&"a".repeat(32)).is_err());
    }

    #[test]
    fn filenames_lose_directories() {
        assert_eq!(safe_filename("../../etc/passwd"), "passwd");
        assert_eq!(safe_filename("C:\\DOS\\FILE.ZIP"), "FILE.ZIP");
        assert_eq!(safe_filename("nodediff.a12"), "nodediff.a12");
        assert_eq!(safe_filename("..."), "_");
        assert_eq!(safe_filename("we ird*.pkt"), "we_ird_.pkt");
    }

    #[test]
    fn wildcards() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("FIDO*", "fidonews"));
        assert!(wildcard_match("R??_*", "r50_chat"));
        assert!(!wildcard_match("FIDO*", "fdn"));
        assert!(wildcard_match_any("OS2*, LINUX*", "linux.kernel"));
        assert!(!wildcard_match_any("", "anything"));
    }

    #[test]
    fn activity_clamps_on_char_boundary() {
        let long = "x".repeat(200);
        assert_eq!(clamp_activity(&long).len(), MAX_ACTIVITY_LEN);
        let multi = format!("{}é", "x".repeat(95));
        let clamped = clamp_activity(&multi);
        assert!(clamped.len() <= MAX_ACTIVITY_LEN);
        assert!(clamped.chars().all(|c| c == 'x'));
    }
}
