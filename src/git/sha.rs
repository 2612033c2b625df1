use crate::errors::BuildError;
use regex::Regex;
use std::sync::LazyLock;

static SHA_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[0-9a-f]{40}$").expect("sha pattern is a valid static regex"));

/// Number of leading characters used for the short form.
const SHORT_LEN: usize = 8;

/// A validated full git sha and its short form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sha {
    full: String,
    short: String,
}

impl Sha {
    /// Validate `raw` as a full 40-character lowercase hex sha.
    pub fn new(raw: &str) -> Result<Self, BuildError> {
        if !SHA_PATTERN.is_match(raw) {
            return Err(BuildError::InvalidGitSha {
                sha: raw.to_string(),
            });
        }
        Ok(Self {
            full: raw.to_string(),
            short: raw[..SHORT_LEN].to_string(),
        })
    }

    pub fn full(&self) -> &str {
        &self.full
    }

    pub fn short(&self) -> &str {
        &self.short
    }
}
