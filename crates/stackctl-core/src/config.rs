//! Environment bundle loading and validation
//!
//! The bundle is a flat `KEY=value` map read from an env file, the process
//! environment, or an in-memory map. Validation is pure: it never touches the
//! process environment and either returns an immutable [`ConfigBundle`] or
//! the first violation in schema order.
//!
//! The key schema is fixed in code ([`ConfigLoader::standard`]); operators
//! cannot extend it at runtime.

use crate::error::ConfigError;
use crate::redact::{is_sensitive_key, redact_values, REDACTED};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Values that are never acceptable for a required key (case-insensitive)
pub const PLACEHOLDER_DENYLIST: &[&str] = &[
    "changeme",
    "change_me",
    "change-me",
    "password",
    "secret",
    "default",
    "example",
    "placeholder",
    "replace_me",
    "todo",
    "xxx",
];

/// Substrings that mark a value as an unfilled template
const PLACEHOLDER_SENTINELS: &[&str] = &["changeme", "change_me", "change-me", "replace_me"];

/// Minimum length for signing secrets
pub const SIGNING_SECRET_MIN_LEN: usize = 32;

/// Minimum length for service passwords
pub const PASSWORD_MIN_LEN: usize = 16;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern"));

static HOSTNAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9]([a-z0-9\-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$").expect("hostname pattern")
});

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern"));

/// Validator attached to a key
#[derive(Debug, Clone)]
pub enum KeyRule {
    /// Any non-placeholder value
    Present,
    /// Security-critical value with a minimum length
    Secret { min_len: usize },
    /// Must match the regex
    Pattern(Regex),
    /// Integer within an inclusive range
    Range { min: i64, max: i64 },
}

/// One entry in the key schema
#[derive(Debug, Clone)]
pub struct KeySpec {
    /// Variable name
    pub name: &'static str,
    /// Validator
    pub rule: KeyRule,
    /// Optional keys are only validated when present
    pub optional: bool,
}

impl KeySpec {
    /// Required key accepting any non-placeholder value
    #[must_use]
    pub fn present(name: &'static str) -> Self {
        Self { name, rule: KeyRule::Present, optional: false }
    }

    /// Required security-critical key
    #[must_use]
    pub fn secret(name: &'static str, min_len: usize) -> Self {
        Self { name, rule: KeyRule::Secret { min_len }, optional: false }
    }

    /// Required key matching `pattern`
    #[must_use]
    pub fn pattern(name: &'static str, pattern: Regex) -> Self {
        Self { name, rule: KeyRule::Pattern(pattern), optional: false }
    }

    /// Required integer key in `min..=max`
    #[must_use]
    pub fn range(name: &'static str, min: i64, max: i64) -> Self {
        Self { name, rule: KeyRule::Range { min, max }, optional: false }
    }

    /// Make the key optional
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    fn check(&self, value: Option<&str>) -> Result<(), ConfigError> {
        let value = match value.map(str::trim) {
            Some(v) if !v.is_empty() => v,
            _ if self.optional => return Ok(()),
            _ => return Err(ConfigError::MissingKey(self.name.to_string())),
        };

        match &self.rule {
            KeyRule::Present => reject_placeholder(self.name, value),
            KeyRule::Secret { min_len } => {
                reject_placeholder(self.name, value)?;
                if value.chars().count() < *min_len {
                    return Err(ConfigError::WeakValue {
                        key: self.name.to_string(),
                        reason: format!("shorter than {min_len} characters"),
                    });
                }
                Ok(())
            }
            KeyRule::Pattern(re) => {
                reject_placeholder(self.name, value)?;
                if re.is_match(value) {
                    Ok(())
                } else {
                    Err(ConfigError::InvalidValue {
                        key: self.name.to_string(),
                        reason: format!("does not match {}", re.as_str()),
                    })
                }
            }
            KeyRule::Range { min, max } => match value.parse::<i64>() {
                Ok(n) if (*min..=*max).contains(&n) => Ok(()),
                Ok(n) => Err(ConfigError::InvalidValue {
                    key: self.name.to_string(),
                    reason: format!("{n} outside {min}..={max}"),
                }),
                Err(_) => Err(ConfigError::InvalidValue {
                    key: self.name.to_string(),
                    reason: "not an integer".to_string(),
                }),
            },
        }
    }

    fn is_secret(&self) -> bool {
        matches!(self.rule, KeyRule::Secret { .. }) || is_sensitive_key(self.name)
    }
}

fn reject_placeholder(key: &str, value: &str) -> Result<(), ConfigError> {
    let lower = value.to_ascii_lowercase();
    if PLACEHOLDER_DENYLIST.contains(&lower.as_str()) {
        return Err(ConfigError::WeakValue {
            key: key.to_string(),
            reason: "placeholder value".to_string(),
        });
    }
    if PLACEHOLDER_SENTINELS.iter().any(|s| lower.contains(s)) {
        return Err(ConfigError::WeakValue {
            key: key.to_string(),
            reason: "contains a CHANGE_ME sentinel".to_string(),
        });
    }
    Ok(())
}

/// Where the bundle comes from
#[derive(Debug, Clone)]
pub enum EnvSource {
    /// Env file with `KEY=value` lines
    File(PathBuf),
    /// Current process environment
    Process,
    /// In-memory map
    Inline(BTreeMap<String, String>),
}

impl EnvSource {
    /// Read all key/value pairs from the source
    ///
    /// # Errors
    /// `ConfigError::Io` or `ConfigError::Malformed` for unreadable env files
    pub fn read(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        match self {
            Self::File(path) => {
                let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                parse_env(&contents, &path.display().to_string())
            }
            Self::Process => Ok(std::env::vars().collect()),
            Self::Inline(map) => Ok(map.clone()),
        }
    }
}

/// Parse env file contents.
///
/// Accepts blank lines, `#` comments, an optional `export ` prefix and
/// values wrapped in matching single or double quotes. Later duplicates win.
///
/// # Errors
/// `ConfigError::Malformed` for lines without `=` or with an invalid key
pub fn parse_env(contents: &str, source_name: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut map = BTreeMap::new();
    for (idx, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map_or(line, str::trim_start);
        let malformed = |reason: &str| ConfigError::Malformed {
            source_name: source_name.to_string(),
            line: idx + 1,
            reason: reason.to_string(),
        };

        let (key, value) = line.split_once('=').ok_or_else(|| malformed("expected KEY=value"))?;
        let key = key.trim();
        if !IDENTIFIER.is_match(key) {
            return Err(malformed("invalid variable name"));
        }
        map.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    Ok(map)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Validated, immutable environment bundle
#[derive(Clone)]
pub struct ConfigBundle {
    values: BTreeMap<String, String>,
    derived: BTreeMap<String, String>,
    secret_keys: BTreeSet<String>,
}

impl ConfigBundle {
    /// Raw value of `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Derived value (e.g. `DATABASE_URL`)
    #[must_use]
    pub fn derived(&self, key: &str) -> Option<&str> {
        self.derived.get(key).map(String::as_str)
    }

    /// Names of all derived values
    pub fn derived_keys(&self) -> impl Iterator<Item = &str> {
        self.derived.keys().map(String::as_str)
    }

    /// Names of all raw keys
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Number of raw keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if no keys were loaded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True if `key` holds a secret
    #[must_use]
    pub fn is_secret(&self, key: &str) -> bool {
        self.secret_keys.contains(key) || is_sensitive_key(key)
    }

    /// Value for display: secrets replaced by `[REDACTED]`
    #[must_use]
    pub fn display_value(&self, key: &str) -> Option<&str> {
        let value = self.get(key).or_else(|| self.derived(key))?;
        Some(if self.is_secret(key) { REDACTED } else { value })
    }

    /// Scrub every secret value in this bundle out of `text`
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        let secrets = self
            .values
            .iter()
            .chain(self.derived.iter())
            .filter(|(k, _)| self.is_secret(k))
            .map(|(_, v)| v.as_str());
        redact_values(text, secrets)
    }
}

impl fmt::Debug for ConfigBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for key in self.values.keys().chain(self.derived.keys()) {
            map.entry(&key, &self.display_value(key).unwrap_or_default());
        }
        map.finish()
    }
}

/// Loads and validates bundles against a fixed key schema
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    schema: Vec<KeySpec>,
}

impl ConfigLoader {
    /// Loader with an explicit schema
    #[must_use]
    pub fn new(schema: Vec<KeySpec>) -> Self {
        Self { schema }
    }

    /// Loader with the stack's built-in schema
    #[must_use]
    pub fn standard() -> Self {
        Self::new(vec![
            KeySpec::pattern("DB_USER", IDENTIFIER.clone()),
            KeySpec::secret("DB_PASSWORD", PASSWORD_MIN_LEN),
            KeySpec::pattern("DB_NAME", IDENTIFIER.clone()),
            KeySpec::present("DB_HOST").optional(),
            KeySpec::range("DB_PORT", 1, 65535).optional(),
            KeySpec::secret("REDIS_PASSWORD", PASSWORD_MIN_LEN),
            KeySpec::present("REDIS_HOST").optional(),
            KeySpec::range("REDIS_PORT", 1, 65535).optional(),
            KeySpec::secret("JWT_SECRET", SIGNING_SECRET_MIN_LEN),
            KeySpec::pattern("DOMAIN", HOSTNAME.clone()),
            KeySpec::pattern("ACME_EMAIL", EMAIL.clone()),
        ])
    }

    /// Key schema in validation order
    #[must_use]
    pub fn schema(&self) -> &[KeySpec] {
        &self.schema
    }

    /// Load and validate a bundle.
    ///
    /// # Errors
    /// The first violation in schema order, or a read/parse error
    pub fn load(&self, source: &EnvSource) -> Result<ConfigBundle, ConfigError> {
        let values = source.read()?;
        self.validate_map(values)
    }

    /// Validate an already-read map
    ///
    /// # Errors
    /// The first violation in schema order
    pub fn validate_map(&self, values: BTreeMap<String, String>) -> Result<ConfigBundle, ConfigError> {
        if let Some(first) = self.violations(&values).into_iter().next() {
            return Err(first);
        }

        let secret_keys = self
            .schema
            .iter()
            .filter(|spec| spec.is_secret())
            .map(|spec| spec.name.to_string())
            .collect();
        let derived = derive_connection_strings(&values);
        tracing::debug!(keys = values.len(), derived = derived.len(), "configuration bundle validated");

        Ok(ConfigBundle { values, derived, secret_keys })
    }

    /// Every violation, in schema order
    ///
    /// # Errors
    /// Only read/parse errors; validation problems are returned in the vector
    pub fn check(&self, source: &EnvSource) -> Result<Vec<ConfigError>, ConfigError> {
        Ok(self.violations(&source.read()?))
    }

    fn violations(&self, values: &BTreeMap<String, String>) -> Vec<ConfigError> {
        self.schema
            .iter()
            .filter_map(|spec| spec.check(values.get(spec.name).map(String::as_str)).err())
            .collect()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::standard()
    }
}

fn derive_connection_strings(values: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let get = |k: &str| values.get(k).map(String::as_str).filter(|v| !v.is_empty());
    let mut derived = BTreeMap::new();

    if let (Some(user), Some(password), Some(db)) = (get("DB_USER"), get("DB_PASSWORD"), get("DB_NAME")) {
        let host = get("DB_HOST").unwrap_or("postgres");
        let port = get("DB_PORT").unwrap_or("5432");
        derived.insert(
            "DATABASE_URL".to_string(),
            format!(
                "postgres://{}:{}@{host}:{port}/{db}",
                percent_encode(user),
                percent_encode(password)
            ),
        );
    }

    if let Some(password) = get("REDIS_PASSWORD") {
        let host = get("REDIS_HOST").unwrap_or("redis");
        let port = get("REDIS_PORT").unwrap_or("6379");
        derived.insert(
            "REDIS_URL".to_string(),
            format!("redis://:{}@{host}:{port}", percent_encode(password)),
        );
    }

    derived
}

/// Percent-encode everything outside RFC 3986 unreserved characters
fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}
