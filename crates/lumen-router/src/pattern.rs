//! Route pattern normalization and validation
//!
//! A pattern is a slash-delimited list of segments:
//! - literal text: `users`, `v1`, `todo-items`
//! - named parameter: `:id` (name matches `[A-Za-z_][A-Za-z0-9_]*`)
//! - wildcard: a bare `*`, only as the last segment

use std::borrow::Cow;
use std::fmt;

/// Parameter key the wildcard segment binds its captured remainder under
pub const WILDCARD_KEY: &str = "*";

/// Reason a pattern was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// Pattern contains a character outside `[A-Za-z0-9/:*_-]`
    InvalidCharacter { pattern: String, found: char },
    /// `:` with an empty or malformed parameter name
    InvalidParam { pattern: String, segment: String },
    /// `*` mixed with other characters in one segment
    InvalidWildcard { pattern: String, segment: String },
    /// `*` somewhere other than the final segment
    WildcardNotLast { pattern: String },
}

impl PatternError {
    /// The offending (normalized) pattern
    pub fn pattern(&self) -> &str {
        match self {
            PatternError::InvalidCharacter { pattern, .. }
            | PatternError::InvalidParam { pattern, .. }
            | PatternError::InvalidWildcard { pattern, .. }
            | PatternError::WildcardNotLast { pattern } => pattern,
        }
    }
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternError::InvalidCharacter { pattern, found } => {
                write!(f, "invalid character {found:?} in pattern {pattern}")
            }
            PatternError::InvalidParam { pattern, segment } => {
                write!(f, "invalid parameter segment {segment:?} in pattern {pattern}")
            }
            PatternError::InvalidWildcard { pattern, segment } => {
                write!(f, "wildcard must be a bare '*', got {segment:?} in pattern {pattern}")
            }
            PatternError::WildcardNotLast { pattern } => {
                write!(f, "wildcard must be the last segment in pattern {pattern}")
            }
        }
    }
}

impl std::error::Error for PatternError {}

/// Normalize a pattern or request path
///
/// Ensures a single leading slash, collapses runs of slashes and strips
/// the trailing slash (except for the root).
///
/// ```
/// use lumen_router::normalize;
///
/// assert_eq!(normalize(""), "/");
/// assert_eq!(normalize("api//v1/"), "/api/v1");
/// ```
pub fn normalize(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 1);
    out.push('/');

    for c in pattern.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }

    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | ':' | '*' | '_' | '-')
}

fn is_valid_param_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Check a pattern, returning the first problem found
pub fn check(pattern: &str) -> Result<(), PatternError> {
    if let Some(found) = pattern.chars().find(|c| !is_allowed_char(*c)) {
        return Err(PatternError::InvalidCharacter {
            pattern: pattern.to_string(),
            found,
        });
    }

    let segments = split_path(pattern);
    let last = segments.len().saturating_sub(1);

    for (i, segment) in segments.iter().enumerate() {
        if let Some(name) = segment.strip_prefix(':') {
            if !is_valid_param_name(name) {
                return Err(PatternError::InvalidParam {
                    pattern: pattern.to_string(),
                    segment: segment.to_string(),
                });
            }
        }

        if segment.contains('*') {
            if *segment != WILDCARD_KEY {
                return Err(PatternError::InvalidWildcard {
                    pattern: pattern.to_string(),
                    segment: segment.to_string(),
                });
            }
            if i != last {
                return Err(PatternError::WildcardNotLast {
                    pattern: pattern.to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Whether a pattern is well formed
pub fn validate(pattern: &str) -> bool {
    check(pattern).is_ok()
}

/// Join a prefix and a pattern, normalize, then validate
///
/// ```
/// use lumen_router::build;
///
/// assert_eq!(build("/api/", "/users/:id").unwrap(), "/api/users/:id");
/// assert!(build("/api", "/files/*/meta").is_err());
/// ```
pub fn build(prefix: &str, pattern: &str) -> Result<String, PatternError> {
    let mut joined = String::with_capacity(prefix.len() + pattern.len());
    joined.push_str(prefix);
    joined.push_str(pattern);

    let full = normalize(&joined);
    check(&full)?;
    Ok(full)
}

/// Split a path into its non-empty segments
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Decode `%XX` escapes
///
/// Malformed escapes are kept as written and invalid UTF-8 is replaced.
/// `+` is literal here; only query strings read it as a space. Input
/// without a `%` is returned as is.
///
/// ```
/// use lumen_router::percent_decode;
///
/// assert_eq!(percent_decode("john%20doe"), "john doe");
/// assert_eq!(percent_decode("100%"), "100%");
/// ```
pub fn percent_decode(s: &str) -> Cow<'_, str> {
    if !s.contains('%') {
        return Cow::Borrowed(s);
    }

    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1).and_then(|b| hex_value(*b));
            let lo = bytes.get(i + 2).and_then(|b| hex_value(*b));
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    Cow::Owned(String::from_utf8_lossy(&out).into_owned())
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
