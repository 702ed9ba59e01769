//! GLOB pattern translation for the PAC `shExpMatch` helper
//!
//! Translation rules: `*` matches any run of characters, `?` exactly one,
//! `.` and `\` are escaped, and a `[!...]` class is negated. Everything
//! else passes through, so `[abc]` classes and `(ab|cd)` groups keep their
//! regex meaning.

use std::collections::HashMap;

use regex::Regex;

use crate::error::{PorticoError, Result};

/// Translate a GLOB expression into an anchored regex pattern.
pub fn glob_to_regex(glob: &str) -> String {
    let mut pattern = String::with_capacity(glob.len() + 2);
    pattern.push('^');
    let chars: Vec<char> = glob.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        match c {
            '*' => pattern.push_str(".*?"),
            '?' => pattern.push_str(".{1}"),
            '.' => pattern.push_str("\\."),
            '\\' => pattern.push_str("\\\\"),
            '!' => {
                if i > 0 && chars[i - 1] == '[' {
                    pattern.push('^');
                } else {
                    pattern.push('!');
                }
            }
            other => pattern.push(*other),
        }
    }
    pattern.push('$');
    pattern
}

/// Bounded cache of compiled glob patterns, keyed by glob source string.
///
/// Each PAC engine worker owns one; a full cache is flushed wholesale
/// rather than tracking recency, which is enough for the handful of
/// patterns a PAC script uses.
pub struct GlobPatternCache {
    capacity: usize,
    patterns: HashMap<String, Regex>,
}

impl GlobPatternCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            patterns: HashMap::new(),
        }
    }

    /// Whether `value` matches the glob, compiling and caching on miss.
    pub fn matches(&mut self, value: &str, glob: &str) -> Result<bool> {
        if let Some(regex) = self.patterns.get(glob) {
            return Ok(regex.is_match(value));
        }

        let regex = Regex::new(&glob_to_regex(glob.trim())).map_err(|e| {
            PorticoError::PacScript(format!("Bad glob pattern [{}]: {}", glob, e))
        })?;
        let matched = regex.is_match(value);

        if self.patterns.len() >= self.capacity {
            self.patterns.clear();
        }
        self.patterns.insert(glob.to_string(), regex);
        Ok(matched)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl Default for GlobPatternCache {
    fn default() -> Self {
        // Plenty for typical PAC scripts, small enough to never matter.
        Self::new(256)
    }
}
