//! Line classification and content fingerprinting.
//!
//! A [`PatternMatcher`] holds an ordered list of error patterns. Patterns
//! that look like regular expressions are compiled case-insensitively;
//! everything else is a case-insensitive substring. A pattern that looks
//! like a regex but fails to compile degrades to a substring match on its
//! raw text rather than being dropped.

use regex::{Regex, RegexBuilder};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Characters whose presence marks a pattern as a regular expression.
const REGEX_MARKERS: [char; 7] = ['^', '$', '*', '+', '(', '[', '\\'];

/// Pattern used when the configured list is empty.
const DEFAULT_PATTERN: &str = "ERR";

/// A single compiled error pattern.
#[derive(Debug, Clone)]
enum Pattern {
    /// Lowercased needle for a case-insensitive substring search.
    Literal(String),
    /// Case-insensitive regex.
    Regex(Regex),
}

impl Pattern {
    fn compile(raw: &str) -> Self {
        if !looks_like_regex(raw) {
            return Self::Literal(raw.to_lowercase());
        }
        match RegexBuilder::new(raw).case_insensitive(true).build() {
            Ok(re) => Self::Regex(re),
            Err(e) => {
                warn!(pattern = raw, error = %e, "invalid regex pattern, matching as literal text");
                Self::Literal(raw.to_lowercase())
            }
        }
    }

    fn matches(&self, line: &str, lowered: &str) -> bool {
        match self {
            Self::Literal(needle) => lowered.contains(needle.as_str()),
            Self::Regex(re) => re.is_match(line),
        }
    }
}

/// Classifies log lines as errors and fingerprints their content.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    patterns: Vec<Pattern>,
}

impl PatternMatcher {
    /// Compile a matcher from raw pattern strings, preserving their order.
    ///
    /// An empty list falls back to the single literal pattern `ERR`.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns: Vec<Pattern> = if patterns.is_empty() {
            vec![Pattern::compile(DEFAULT_PATTERN)]
        } else {
            patterns.iter().map(|p| Pattern::compile(p.as_ref())).collect()
        };
        Self { patterns }
    }

    /// Whether any pattern matches `line`. Blank lines never match.
    pub fn is_error(&self, line: &str) -> bool {
        if line.trim().is_empty() {
            return false;
        }
        let lowered = line.to_lowercase();
        self.patterns.iter().any(|p| p.matches(line, &lowered))
    }

    /// Lowercase hex SHA-256 of the line's UTF-8 bytes.
    pub fn fingerprint(line: &str) -> String {
        hex::encode(Sha256::digest(line.as_bytes()))
    }
}

/// Whether a raw pattern should be treated as a regular expression.
fn looks_like_regex(raw: &str) -> bool {
    raw.contains(REGEX_MARKERS)
}
