//! Dockerignore-style pattern matching for build context assembly.
//!
//! One pattern per line; `!` negates, blank lines and `#` comments are
//! skipped. The last matching pattern decides whether a path is excluded.

use globset::{Glob, GlobMatcher};
use std::path::Path;

use crate::error::{Result, SkiffError};

struct Pattern {
    /// Matches the path itself
    matcher: GlobMatcher,
    /// Matches anything beneath the path when it names a directory
    children: GlobMatcher,
    /// True for `!`-prefixed patterns which re-include a path
    negate: bool,
}

/// A parsed ignore file.
pub struct IgnorePatterns {
    patterns: Vec<Pattern>,
}

impl IgnorePatterns {
    /// Parse ignore-file contents.
    pub fn parse(content: &str) -> Result<Self> {
        let mut patterns = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (negate, raw) = match line.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, line),
            };
            let raw = raw.trim_start_matches("./").trim_end_matches('/');
            if raw.is_empty() {
                continue;
            }
            patterns.push(Pattern {
                matcher: compile(raw)?,
                children: compile(&format!("{}/**", raw))?,
                negate,
            });
        }
        Ok(Self { patterns })
    }

    /// An empty pattern set that excludes nothing.
    pub fn empty() -> Self {
        Self { patterns: Vec::new() }
    }

    /// True when `path` (relative to the context root) is excluded.
    pub fn is_excluded(&self, path: &Path) -> bool {
        let mut excluded = false;
        for pattern in &self.patterns {
            if pattern.matcher.is_match(path) || pattern.children.is_match(path) {
                excluded = !pattern.negate;
            }
        }
        excluded
    }
}

fn compile(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| SkiffError::InvalidIgnorePattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}
