//! Declarative change matchers: path patterns, content patterns and exact
//! content hashes, with optional dump side effects.
//!
//! Patterns compile at construction; a bad pattern is a configuration error
//! surfaced before any layer is scanned. Evaluation is read-only against
//! object metadata, with bounded content reads for data patterns.

use crate::hash;
use crate::objects::ObjectMetadata;
use crate::tar_index::TarIndex;
use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Objects larger than this skip data-pattern evaluation.
pub const MAX_MATCH_DATA_SIZE: u64 = 10 * 1024 * 1024;

/// Where a matched object's content is written as a side effect.
#[derive(Debug, Clone)]
pub enum DumpSink {
    Console,
    Dir(PathBuf),
}

/// Matches an object's full path against a regex; optionally dumps content.
#[derive(Debug)]
pub struct ChangePathMatcher {
    pattern: regex::Regex,
    pub dump: Option<DumpSink>,
}

impl ChangePathMatcher {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = regex::Regex::new(pattern)
            .with_context(|| format!("invalid path matcher pattern: {pattern}"))?;
        Ok(ChangePathMatcher {
            pattern,
            dump: None,
        })
    }

    pub fn with_dump(mut self, sink: DumpSink) -> Self {
        self.dump = Some(sink);
        self
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn matches(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }
}

/// Matches file content against a regex, with an optional path pre-filter.
///
/// Content is only read when the pre-filter (if any) already matched, and
/// only up to [`MAX_MATCH_DATA_SIZE`].
#[derive(Debug)]
pub struct ChangeDataMatcher {
    path_pattern: Option<regex::Regex>,
    data_pattern: regex::bytes::Regex,
}

impl ChangeDataMatcher {
    pub fn new(path_pattern: Option<&str>, data_pattern: &str) -> Result<Self> {
        let path_pattern = match path_pattern {
            Some(p) => Some(
                regex::Regex::new(p)
                    .with_context(|| format!("invalid data matcher path pattern: {p}"))?,
            ),
            None => None,
        };
        let data_pattern = regex::bytes::Regex::new(data_pattern)
            .with_context(|| format!("invalid data matcher pattern: {data_pattern}"))?;
        Ok(ChangeDataMatcher {
            path_pattern,
            data_pattern,
        })
    }

    pub fn pattern(&self) -> &str {
        self.data_pattern.as_str()
    }

    pub fn path_admits(&self, path: &str) -> bool {
        self.path_pattern.as_ref().map_or(true, |p| p.is_match(path))
    }

    pub fn matches_data(&self, data: &[u8]) -> bool {
        self.data_pattern.is_match(data)
    }
}

/// Matches an object's precomputed content hash exactly.
#[derive(Debug, Clone, Copy)]
pub struct ChangeDataHashMatcher {
    pub hash: u64,
}

impl ChangeDataHashMatcher {
    /// Parses a hex hash string (case-insensitive).
    pub fn parse(hex: &str) -> Result<Self> {
        let hash =
            hash::parse_hex(hex).ok_or_else(|| anyhow!("invalid hash matcher value: {hex}"))?;
        Ok(ChangeDataHashMatcher { hash })
    }
}

/// The configured matchers of one inspection run.
#[derive(Debug, Default)]
pub struct MatcherSet {
    pub path: Vec<ChangePathMatcher>,
    pub data: Vec<ChangeDataMatcher>,
    pub hash: Vec<ChangeDataHashMatcher>,
}

impl MatcherSet {
    pub fn is_empty(&self) -> bool {
        self.path.is_empty() && self.data.is_empty() && self.hash.is_empty()
    }

    /// Evaluates every matcher kind against one object.
    ///
    /// Deleted objects never reach this call: their content is gone, so they
    /// are reported unconditionally.
    pub fn evaluate(&self, obj: &ObjectMetadata, index: &TarIndex) -> Result<MatchOutcome> {
        let display_path = format!("/{}", obj.name);
        let mut outcome = MatchOutcome::default();

        for matcher in &self.path {
            if matcher.matches(&display_path) {
                outcome.path_matched.push(matcher.pattern().to_string());
                if let Some(sink) = &matcher.dump {
                    self.dump_object(obj, index, sink);
                }
            }
        }

        if !self.data.is_empty() {
            let mut content: Option<Vec<u8>> = None;
            for matcher in &self.data {
                if !matcher.path_admits(&display_path) {
                    continue;
                }
                if obj.size > MAX_MATCH_DATA_SIZE {
                    debug!(
                        "object exceeds data match size bound, skipping: {}",
                        obj.name
                    );
                    continue;
                }
                if content.is_none() {
                    content = Some(self.read_content(obj, index)?);
                }
                if let Some(data) = &content {
                    if matcher.matches_data(data) {
                        outcome.data_matched.push(matcher.pattern().to_string());
                    }
                }
            }
        }

        if let Some(h) = obj.hash {
            outcome.hash_matched = self.hash.iter().any(|m| m.hash == h);
        }

        Ok(outcome)
    }

    fn read_content(&self, obj: &ObjectMetadata, index: &TarIndex) -> Result<Vec<u8>> {
        match index.get(&obj.name) {
            Some(meta) => index.read_entry(meta),
            None => Ok(Vec::new()),
        }
    }

    fn dump_object(&self, obj: &ObjectMetadata, index: &TarIndex, sink: &DumpSink) {
        let content = match self.read_content(obj, index) {
            Ok(c) => c,
            Err(err) => {
                warn!("failed reading {} for dump: {err}", obj.name);
                return;
            }
        };
        match sink {
            DumpSink::Console => {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(&content);
                let _ = stdout.write_all(b"\n");
            }
            DumpSink::Dir(dir) => {
                let target = dir.join(&obj.name);
                if let Some(parent) = target.parent() {
                    if let Err(err) = fs::create_dir_all(parent) {
                        warn!("failed creating dump dir {}: {err}", parent.display());
                        return;
                    }
                }
                if let Err(err) = fs::write(&target, &content) {
                    warn!("failed dumping {} to {}: {err}", obj.name, target.display());
                }
            }
        }
    }
}

/// Which matchers of each kind matched one object.
#[derive(Debug, Default, Clone)]
pub struct MatchOutcome {
    pub path_matched: Vec<String>,
    pub data_matched: Vec<String>,
    pub hash_matched: bool,
}

impl MatchOutcome {
    /// The filtering policy: a kind with zero configured matchers admits
    /// everything; a configured kind admits only objects it matched.
    pub fn admits(&self, set: &MatcherSet) -> bool {
        if !set.path.is_empty() && self.path_matched.is_empty() {
            return false;
        }
        if !set.data.is_empty() && self.data_matched.is_empty() {
            return false;
        }
        if !set.hash.is_empty() && !self.hash_matched {
            return false;
        }
        true
    }
}
