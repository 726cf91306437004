//! Metric key parsing.
//!
//! Keys have the form `name` or `name[param1,param2,...]`. Parameters may be
//! double-quoted to carry commas or brackets; `\"` escapes a quote inside a
//! quoted parameter.

use std::fmt;

use thiserror::Error;

use crate::config::{MAX_LINES_PER_SECOND, MIN_LINES_PER_SECOND};

/// Errors produced while parsing a metric key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// Key name is empty.
    #[error("metric key name is empty")]
    EmptyName,

    /// Name contains a character outside `[A-Za-z0-9._-]`.
    #[error("invalid character '{ch}' in metric key name at position {pos}")]
    InvalidName { ch: char, pos: usize },

    /// Parameter list is not closed.
    #[error("unterminated parameter list")]
    UnterminatedParams,

    /// Quoted parameter is not closed.
    #[error("unterminated quoted parameter")]
    UnterminatedQuote,

    /// Characters follow a closing quote or bracket.
    #[error("unexpected character '{ch}' at position {pos}")]
    Unexpected { ch: char, pos: usize },

    /// A parameter has an invalid value.
    #[error("invalid parameter {index}: {reason}")]
    InvalidParam { index: usize, reason: String },
}

/// A parsed metric key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    raw: String,
    name: String,
    params: Vec<String>,
}

/// Kind of line-oriented source a key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogKind {
    Log,
    EventLog,
}

impl MetricKey {
    /// Parse a key string.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let raw = raw.trim();
        let name_end = raw.find('[').unwrap_or(raw.len());
        let name = &raw[..name_end];

        if name.is_empty() {
            return Err(KeyError::EmptyName);
        }
        if let Some((pos, ch)) = name
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(KeyError::InvalidName { ch, pos });
        }

        let params = if name_end < raw.len() {
            parse_params(raw, name_end + 1)?
        } else {
            Vec::new()
        };

        let key = Self {
            raw: raw.to_string(),
            name: name.to_string(),
            params,
        };
        key.max_lines()?;
        Ok(key)
    }

    /// Key as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Item name before the parameter list.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameters in order; empty parameters are kept as empty strings.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// 0-based parameter, `None` when missing or empty.
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params
            .get(index)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }

    /// Whether a fetch may yield several lines.
    pub fn is_log_like(&self) -> bool {
        self.log_kind().is_some()
    }

    /// Lines-per-second override from the key's `maxlines` parameter,
    /// clamped to the supported range.
    pub fn max_lines(&self) -> Result<Option<u32>, KeyError> {
        let index = match self.log_kind() {
            Some(LogKind::Log) => 3,
            Some(LogKind::EventLog) => 5,
            None => return Ok(None),
        };

        let Some(value) = self.param(index) else {
            return Ok(None);
        };

        let lines: u64 = value.trim().parse().map_err(|_| KeyError::InvalidParam {
            index: index + 1,
            reason: format!("maxlines '{value}' is not a number"),
        })?;

        let clamped = lines.clamp(
            u64::from(MIN_LINES_PER_SECOND),
            u64::from(MAX_LINES_PER_SECOND),
        );
        Ok(Some(clamped as u32))
    }

    fn log_kind(&self) -> Option<LogKind> {
        match self.name.as_str() {
            "log" | "logrt" => Some(LogKind::Log),
            "eventlog" => Some(LogKind::EventLog),
            _ => None,
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for MetricKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parse the parameter list starting right after `[`.
fn parse_params(raw: &str, start: usize) -> Result<Vec<String>, KeyError> {
    let mut params = Vec::new();
    let mut chars = raw[start..].char_indices().map(|(i, c)| (i + start, c)).peekable();

    loop {
        // Leading spaces are skipped before each parameter.
        while chars.next_if(|(_, c)| *c == ' ').is_some() {}

        let mut current = String::new();
        match chars.peek().copied() {
            None => return Err(KeyError::UnterminatedParams),
            Some((_, '"')) => {
                chars.next();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '\\' if chars.peek().map(|(_, n)| *n) == Some('"') => {
                            chars.next();
                            current.push('"');
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => current.push(other),
                    }
                }
                if !closed {
                    return Err(KeyError::UnterminatedQuote);
                }
                while chars.next_if(|(_, c)| *c == ' ').is_some() {}
            }
            Some(_) => {
                while let Some((_, c)) = chars.next_if(|(_, c)| *c != ',' && *c != ']') {
                    current.push(c);
                }
            }
        }

        params.push(current);

        match chars.next() {
            Some((_, ',')) => continue,
            Some((_, ']')) => break,
            Some((pos, ch)) => return Err(KeyError::Unexpected { ch, pos }),
            None => return Err(KeyError::UnterminatedParams),
        }
    }

    if let Some((pos, ch)) = chars.next() {
        return Err(KeyError::Unexpected { ch, pos });
    }

    Ok(params)
}
