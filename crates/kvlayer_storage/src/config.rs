//! Engine configuration strings.
//!
//! Engines are configured with a comma-separated `key=value` grammar:
//!
//! ```text
//! create,cache_size=4G,log=(enabled=true,path=journal),extensions=[a,b]
//! ```
//!
//! - a bare key is a flag (`create`)
//! - `(...)` nests another configuration
//! - `[...]` is a list of raw items
//! - later occurrences of a key override earlier ones, so caller-supplied
//!   extra options can simply be appended

use crate::error::{EngineError, EngineResult};
use std::fmt;

/// A value in a configuration string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    /// A bare key with no value.
    Flag,
    /// A scalar such as `4G`, `true` or `journal`.
    Scalar(String),
    /// A parenthesised nested configuration.
    Nested(EngineConfig),
    /// A bracketed list of raw items.
    List(Vec<String>),
}

/// A parsed configuration string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    entries: Vec<(String, ConfigValue)>,
}

impl EngineConfig {
    /// Parses a configuration string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for unbalanced brackets, empty keys or
    /// trailing garbage.
    pub fn parse(input: &str) -> EngineResult<Self> {
        let mut entries = Vec::new();
        for item in split_top_level(input)? {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = match find_top_level(item, '=') {
                Some(pos) => (item[..pos].trim(), Some(item[pos + 1..].trim())),
                None => (item, None),
            };
            if key.is_empty() || !key.chars().all(is_key_char) {
                return Err(EngineError::InvalidConfig(format!(
                    "invalid key '{key}' in '{input}'"
                )));
            }
            let value = match value {
                None => ConfigValue::Flag,
                Some(raw) => parse_value(raw)?,
            };
            entries.push((key.to_string(), value));
        }
        Ok(Self { entries })
    }

    /// Returns the last value given for `key`.
    ///
    /// Dotted paths descend into nested configurations (`log.enabled`).
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        match key.split_once('.') {
            Some((head, rest)) => match self.lookup(head)? {
                ConfigValue::Nested(inner) => inner.get(rest),
                _ => None,
            },
            None => self.lookup(key),
        }
    }

    fn lookup(&self, key: &str) -> Option<&ConfigValue> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Returns a scalar value.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            ConfigValue::Scalar(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns a boolean. A bare flag counts as `true`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the value is not a boolean.
    pub fn get_bool(&self, key: &str) -> EngineResult<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(ConfigValue::Flag) => Ok(Some(true)),
            Some(ConfigValue::Scalar(s)) => match s.as_str() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                other => Err(EngineError::InvalidConfig(format!(
                    "expected boolean for '{key}', got '{other}'"
                ))),
            },
            Some(_) => Err(EngineError::InvalidConfig(format!(
                "expected boolean for '{key}'"
            ))),
        }
    }

    /// Returns a size such as `2GB` or `512M` in bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the value is not a size.
    pub fn get_size(&self, key: &str) -> EngineResult<Option<u64>> {
        match self.get_str(key) {
            None => Ok(None),
            Some(raw) => parse_size(raw).map(Some),
        }
    }

    /// Returns the configured entries in order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match value {
                ConfigValue::Flag => write!(f, "{key}")?,
                ConfigValue::Scalar(s) => write!(f, "{key}={s}")?,
                ConfigValue::Nested(inner) => write!(f, "{key}=({inner})")?,
                ConfigValue::List(items) => write!(f, "{key}=[{}]", items.join(","))?,
            }
        }
        Ok(())
    }
}

/// Parses a size with an optional `B`, `K`, `M`, `G` or `T` suffix.
///
/// # Errors
///
/// Returns `InvalidConfig` if the string is not a size.
pub(crate) fn parse_size(raw: &str) -> EngineResult<u64> {
    let upper = raw.trim().to_ascii_uppercase();
    let digits_end = upper
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(upper.len());
    let (digits, suffix) = upper.split_at(digits_end);
    let base: u64 = digits
        .parse()
        .map_err(|_| EngineError::InvalidConfig(format!("invalid size '{raw}'")))?;
    let multiplier: u64 = match suffix {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        "T" | "TB" => 1 << 40,
        _ => {
            return Err(EngineError::InvalidConfig(format!(
                "invalid size suffix in '{raw}'"
            )))
        }
    };
    base.checked_mul(multiplier)
        .ok_or_else(|| EngineError::InvalidConfig(format!("size '{raw}' overflows")))
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'
}

fn parse_value(raw: &str) -> EngineResult<ConfigValue> {
    if let Some(inner) = strip_delimited(raw, '(', ')')? {
        return Ok(ConfigValue::Nested(EngineConfig::parse(inner)?));
    }
    if let Some(inner) = strip_delimited(raw, '[', ']')? {
        let items = split_top_level(inner)?
            .into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        return Ok(ConfigValue::List(items));
    }
    if raw.contains(['(', ')', '[', ']']) {
        return Err(EngineError::InvalidConfig(format!(
            "unexpected bracket in value '{raw}'"
        )));
    }
    Ok(ConfigValue::Scalar(raw.trim_matches('"').to_string()))
}

fn strip_delimited(raw: &str, open: char, close: char) -> EngineResult<Option<&str>> {
    if !raw.starts_with(open) {
        return Ok(None);
    }
    if !raw.ends_with(close) || raw.len() < 2 {
        return Err(EngineError::InvalidConfig(format!(
            "unterminated '{open}' in '{raw}'"
        )));
    }
    Ok(Some(&raw[1..raw.len() - 1]))
}

/// Splits on commas that are not nested inside brackets.
fn split_top_level(input: &str) -> EngineResult<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => {
                depth -= 1;
                if depth < 0 {
                    return Err(EngineError::InvalidConfig(format!(
                        "unbalanced '{c}' in '{input}'"
                    )));
                }
            }
            ',' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(EngineError::InvalidConfig(format!(
            "unbalanced brackets in '{input}'"
        )));
    }
    parts.push(&input[start..]);
    Ok(parts)
}

fn find_top_level(input: &str, needle: char) -> Option<usize> {
    let mut depth = 0i32;
    for (i, c) in input.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            c if c == needle && depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}
