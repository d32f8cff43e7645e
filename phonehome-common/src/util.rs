//! Shared utilities for the PhoneHome bridge.

use crate::types::CorrelationToken;
use regex::Regex;

/// Pattern locating the `hostname=<value>` fragment a VM posts home.
///
/// Anchored at the start of the body and confined to the first line; the
/// greedy prefix makes the last fragment on that line win. Word characters are
/// ASCII only.
pub const HOSTNAME_PATTERN: &str = r"^[^\n]*hostname=((?-u:[\w-])*)";

/// Maximum number of characters of a payload written to logs.
pub const LOG_PREVIEW_CHARS: usize = 120;

/// Extracts the correlation token from a connectivity callback body.
#[derive(Debug, Clone)]
pub struct HostnameExtractor {
    pattern: Regex,
}

impl HostnameExtractor {
    /// Compile the hostname pattern.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(HOSTNAME_PATTERN)?,
        })
    }

    /// Return the hostname carried by the first line of `payload`, if any.
    ///
    /// An empty value (`hostname=` followed by a non-word character) yields
    /// `None`, even when an earlier fragment on the line had a value.
    pub fn extract(&self, payload: &str) -> Option<CorrelationToken> {
        self.pattern
            .captures(payload)
            .and_then(|caps| caps.get(1))
            .and_then(|m| CorrelationToken::new(m.as_str()))
    }
}

/// Shorten a payload for log output, keeping it on a single line.
pub fn preview_payload(payload: &str) -> String {
    let mut preview: String = payload
        .chars()
        .take(LOG_PREVIEW_CHARS)
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if payload.chars().count() > LOG_PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview
}
