//! Secret redaction for log output and diagnostics.
//!
//! Captured container log tails end up in operator-facing logs, and the
//! environment bundle ends up in debug output; both pass through here.

use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

/// Replacement text for redacted secrets
pub const REDACTED: &str = "[REDACTED]";

/// Key names whose values are treated as secrets
static SENSITIVE_KEY_NAMES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i).*password.*",
        r"(?i).*passwd.*",
        r"(?i).*secret.*",
        r"(?i).*token.*",
        r"(?i).*api[_\-]?key.*",
        r"(?i).*private[_\-]?key.*",
        r"(?i).*credential.*",
        r"(?i)^DATABASE_URL$",
        r"(?i)^REDIS_URL$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid sensitive key pattern"))
    .collect()
});

/// Patterns matching secrets embedded in free text
static SECRET_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        // credentials in connection URLs
        (
            Regex::new(r"(?P<scheme>[a-z][a-z0-9+.\-]*://)[^/@\s:]*:[^/@\s]+@").expect("url pattern"),
            "${scheme}[REDACTED]@",
        ),
        // key=value / key: value assignments
        (
            Regex::new(r#"(?i)(?P<key>password|passwd|pwd|secret|token|api[_-]?key)(?P<sep>['"]?\s*[:=]\s*)['"]?[^\s'",]{4,}['"]?"#)
                .expect("assignment pattern"),
            "${key}${sep}[REDACTED]",
        ),
        (
            Regex::new(r"(?i)bearer\s+[a-z0-9_.=\-]+").expect("bearer pattern"),
            "Bearer [REDACTED]",
        ),
        (
            Regex::new(r"-----BEGIN[A-Z ]*PRIVATE KEY-----[\s\S]*?-----END[A-Z ]*PRIVATE KEY-----")
                .expect("private key pattern"),
            "[REDACTED PRIVATE KEY]",
        ),
    ]
});

/// True if values stored under `key` must never be shown
#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEY_NAMES.iter().any(|re| re.is_match(key))
}

/// Redact secret-looking fragments from free text
#[must_use]
pub fn redact_text(text: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(text);
    for (re, replacement) in SECRET_PATTERNS.iter() {
        if re.is_match(&out) {
            out = Cow::Owned(re.replace_all(&out, *replacement).into_owned());
        }
    }
    out
}

/// Redact every literal occurrence of the given secret values.
///
/// Values shorter than four characters are skipped so that redaction does
/// not shred unrelated text.
#[must_use]
pub fn redact_values<'a, I>(text: &str, secrets: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = text.to_string();
    for secret in secrets {
        if secret.len() >= 4 && out.contains(secret) {
            out = out.replace(secret, REDACTED);
        }
    }
    out
}
