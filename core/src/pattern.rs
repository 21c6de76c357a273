// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Glob matching for benchmark-id patterns.
//!
//! Pause, resume, abort and status accept ids containing `*` and `?`
//! wildcards; an empty pattern list matches every benchmark.

use regex::Regex;

/// A set of compiled glob patterns over benchmark ids
#[derive(Debug, Clone)]
pub struct IdPatterns {
    patterns: Vec<Regex>,
}

impl IdPatterns {
    /// Compile a pattern list. Empty input (or an empty string pattern)
    /// matches everything.
    pub fn compile(patterns: &[String]) -> Self {
        let compiled = patterns
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| glob_to_regex(p))
            .collect();
        Self { patterns: compiled }
    }

    /// Whether the given id matches any pattern
    pub fn matches(&self, id: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        self.patterns.iter().any(|p| p.is_match(id))
    }

    /// Whether this set was compiled from explicit patterns
    pub fn is_explicit(&self) -> bool {
        !self.patterns.is_empty()
    }
}

fn glob_to_regex(glob: &str) -> Regex {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            _ => pattern.push_str(&regex::escape(&ch.to_string())),
        }
    }
    pattern.push('$');
    // escaped globs are always valid expressions
    Regex::new(&pattern).unwrap_or_else(|_| Regex::new("^$").unwrap())
}
