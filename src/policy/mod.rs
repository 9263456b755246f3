//! Reclamation policies: pluggable predicates over candidates.
//!
//! Each policy turns a `(candidate, env-snapshot)` pair into a [`Decision`].
//! Policies never touch the filesystem; everything they need is on the
//! candidate. Composition is the recursive [`CompositePolicy`] sum type.

#![allow(missing_docs)]

use std::path::Path;
use std::time::Duration;

use regex::Regex;

use crate::core::config::PolicyConfig;
use crate::core::errors::{Result, SageError};
use crate::core::types::{Candidate, Decision, EnvSnapshot, TargetKind};

/// A deletion-eligibility predicate.
pub trait Policy: Send + Sync {
    /// Evaluate one candidate against the run's environment snapshot.
    fn evaluate(&self, candidate: &Candidate, env: &EnvSnapshot) -> Decision;

    /// Stable policy name for diagnostics.
    fn name(&self) -> &str;
}

const SECS_PER_DAY: u64 = 86_400;
const MIB: u64 = 1_048_576;
/// Age contribution is capped at ten years.
const MAX_AGE_DAYS: u64 = 3_650;
/// Size contribution is capped at 1 GiB.
const MAX_SIZE_MIB: u64 = 1_024;

fn age_days(candidate: &Candidate, env: &EnvSnapshot) -> u64 {
    env.now
        .duration_since(candidate.modified)
        .unwrap_or(Duration::ZERO)
        .as_secs()
        / SECS_PER_DAY
}

fn size_mib(candidate: &Candidate) -> u64 {
    candidate.size_bytes / MIB
}

// ──────────────────── age ────────────────────

/// Allows entries whose modification time is at least `min_age_days` old.
#[derive(Debug, Clone)]
pub struct AgePolicy {
    min_age_days: u64,
}

impl AgePolicy {
    #[must_use]
    pub fn new(min_age_days: u64) -> Self {
        Self { min_age_days }
    }
}

impl Policy for AgePolicy {
    fn evaluate(&self, candidate: &Candidate, env: &EnvSnapshot) -> Decision {
        let age = env
            .now
            .duration_since(candidate.modified)
            .unwrap_or(Duration::ZERO);
        if age < Duration::from_secs(self.min_age_days * SECS_PER_DAY) {
            return Decision::denied("too_new");
        }
        let score = age_days(candidate, env).min(MAX_AGE_DAYS) * 10
            + size_mib(candidate).min(MAX_SIZE_MIB);
        Decision::allowed("age_ok", score)
    }

    fn name(&self) -> &str {
        "age"
    }
}

// ──────────────────── size ────────────────────

/// Allows entries of at least `min_mb` mebibytes.
#[derive(Debug, Clone)]
pub struct SizePolicy {
    min_bytes: u64,
}

impl SizePolicy {
    #[must_use]
    pub fn new(min_mb: u64) -> Self {
        Self {
            min_bytes: min_mb * MIB,
        }
    }
}

impl Policy for SizePolicy {
    fn evaluate(&self, candidate: &Candidate, _env: &EnvSnapshot) -> Decision {
        if candidate.size_bytes < self.min_bytes {
            return Decision::denied("too_small");
        }
        Decision::allowed("size_ok", size_mib(candidate).min(MAX_SIZE_MIB))
    }

    fn name(&self) -> &str {
        "size"
    }
}

// ──────────────────── extension ────────────────────

/// Allows files whose extension matches the configured list,
/// case-insensitively. Directories never match.
#[derive(Debug, Clone)]
pub struct ExtensionPolicy {
    extensions: Vec<String>,
}

impl ExtensionPolicy {
    /// Entries may be listed with or without a leading dot.
    #[must_use]
    pub fn new(extensions: &[String]) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }
}

impl Policy for ExtensionPolicy {
    fn evaluate(&self, candidate: &Candidate, _env: &EnvSnapshot) -> Decision {
        if candidate.kind == TargetKind::File
            && let Some(ext) = candidate.path.extension()
        {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            if self.extensions.iter().any(|e| *e == ext) {
                return Decision::allowed("extension_match", 100);
            }
        }
        Decision::denied("extension_mismatch")
    }

    fn name(&self) -> &str {
        "extension"
    }
}

// ──────────────────── exclusion ────────────────────

/// Denies entries matching any configured glob; a veto policy.
///
/// Matching runs in order against (1) the base name, (2) the full path,
/// (3) a `**`-recursive rule: the pattern is split at its first `**`, the
/// prefix must appear as consecutive directory components of the path, and
/// a non-trivial suffix must match the base name.
pub struct ExclusionPolicy {
    globs: Vec<CompiledGlob>,
}

struct CompiledGlob {
    original: String,
    whole: Regex,
    recursive: Option<RecursiveRule>,
}

struct RecursiveRule {
    prefix_components: Vec<String>,
    suffix: Option<Regex>,
}

impl ExclusionPolicy {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let globs = patterns
            .iter()
            .map(|pattern| {
                Ok(CompiledGlob {
                    original: pattern.clone(),
                    whole: glob_to_regex(pattern)?,
                    recursive: recursive_rule(pattern)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { globs })
    }

    fn matching_pattern(&self, path: &Path) -> Option<&str> {
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let full = path.to_string_lossy();

        for glob in &self.globs {
            if glob.whole.is_match(&base) || glob.whole.is_match(&full) {
                return Some(&glob.original);
            }
            if let Some(rule) = &glob.recursive
                && rule.matches(path, &base)
            {
                return Some(&glob.original);
            }
        }
        None
    }
}

impl RecursiveRule {
    fn matches(&self, path: &Path, base: &str) -> bool {
        if !self.prefix_components.is_empty() {
            let components: Vec<String> = path
                .components()
                .filter_map(|c| match c {
                    std::path::Component::Normal(s) => Some(s.to_string_lossy().to_string()),
                    _ => None,
                })
                .collect();
            if !contains_consecutive(&components, &self.prefix_components) {
                return false;
            }
        }
        match &self.suffix {
            Some(suffix) => suffix.is_match(base),
            None => true,
        }
    }
}

fn contains_consecutive(haystack: &[String], needle: &[String]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

/// Build the `**`-recursive rule for a pattern, if it contains `**`.
fn recursive_rule(pattern: &str) -> Result<Option<RecursiveRule>> {
    let Some(split_at) = pattern.find("**") else {
        return Ok(None);
    };
    let prefix = pattern[..split_at].trim_end_matches('/');
    let raw_suffix = pattern[split_at + 2..].trim_start_matches('/');

    let prefix_components = prefix
        .split('/')
        .filter(|c| !c.is_empty())
        .map(ToString::to_string)
        .collect();
    // A trivial suffix ("" or lone "*") means the prefix alone decides.
    let suffix = if raw_suffix.is_empty() || raw_suffix == "*" {
        None
    } else {
        Some(glob_to_regex(raw_suffix)?)
    };
    Ok(Some(RecursiveRule {
        prefix_components,
        suffix,
    }))
}

impl Policy for ExclusionPolicy {
    fn evaluate(&self, candidate: &Candidate, _env: &EnvSnapshot) -> Decision {
        if self.globs.is_empty() {
            return Decision::allowed("no_exclusions", 0);
        }
        match self.matching_pattern(&candidate.path) {
            Some(pattern) => Decision::denied(format!("excluded:{pattern}")),
            None => Decision::allowed("not_excluded", 0),
        }
    }

    fn name(&self) -> &str {
        "exclusion"
    }
}

/// Convert a shell-style glob pattern to an anchored regex.
///
/// `**` matches across separators (`**/` also matches zero directories),
/// `*` stays within one component, `?` is a single non-separator
/// character. Everything else matches literally.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let normalized = pattern.replace('\\', "/");
    let mut regex_str = String::with_capacity(normalized.len() * 2 + 2);
    regex_str.push('^');

    let mut segments = normalized.split("**");
    if let Some(head) = segments.next() {
        regex_str.push_str(&component_glob(head));
    }
    for segment in segments {
        match segment.strip_prefix('/') {
            Some(tail) => {
                regex_str.push_str("(?:.*/)?");
                regex_str.push_str(&component_glob(tail));
            }
            None => {
                regex_str.push_str(".*");
                regex_str.push_str(&component_glob(segment));
            }
        }
    }
    regex_str.push('$');

    Regex::new(&regex_str).map_err(|err| SageError::InvalidConfig {
        details: format!("invalid glob pattern {pattern:?}: {err}"),
    })
}

/// Translate a `**`-free glob segment: literal runs are escaped whole,
/// with the single-component wildcards spliced between them.
fn component_glob(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len() * 2);
    let mut literal_start = 0;
    for (idx, wildcard) in segment.match_indices(['*', '?']) {
        out.push_str(&regex::escape(&segment[literal_start..idx]));
        out.push_str(if wildcard == "*" { "[^/]*" } else { "[^/]" });
        literal_start = idx + wildcard.len();
    }
    out.push_str(&regex::escape(&segment[literal_start..]));
    out
}

// ──────────────────── composite ────────────────────

/// How a composite combines its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeMode {
    /// AND: every child must allow.
    All,
    /// OR: any allowing child suffices.
    Any,
}

/// Recursive combination of policies.
pub struct CompositePolicy {
    mode: CompositeMode,
    children: Vec<Box<dyn Policy>>,
}

impl CompositePolicy {
    #[must_use]
    pub fn new(mode: CompositeMode, children: Vec<Box<dyn Policy>>) -> Self {
        Self { mode, children }
    }

    fn evaluate_all(&self, candidate: &Candidate, env: &EnvSnapshot) -> Decision {
        let mut min_score = u64::MAX;
        for child in &self.children {
            let decision = child.evaluate(candidate, env);
            if !decision.allow {
                return Decision::denied(format!("and_deny:{}", decision.reason));
            }
            min_score = min_score.min(decision.score);
        }
        Decision::allowed("and_allow", min_score)
    }

    fn evaluate_any(&self, candidate: &Candidate, env: &EnvSnapshot) -> Decision {
        let mut best: Option<Decision> = None;
        let mut first_deny: Option<Decision> = None;
        for child in &self.children {
            let decision = child.evaluate(candidate, env);
            if decision.allow {
                let better = best.as_ref().is_none_or(|b| decision.score > b.score);
                if better {
                    best = Some(decision);
                }
            } else if first_deny.is_none() {
                first_deny = Some(decision);
            }
        }
        match (best, first_deny) {
            (Some(winner), _) => Decision::allowed(
                format!("or_allow:{}", winner.reason),
                winner.score,
            ),
            (None, Some(deny)) => Decision::denied(format!("or_deny:{}", deny.reason)),
            (None, None) => Decision::denied("no_policies"),
        }
    }
}

impl Policy for CompositePolicy {
    fn evaluate(&self, candidate: &Candidate, env: &EnvSnapshot) -> Decision {
        if self.children.is_empty() {
            return Decision::denied("no_policies");
        }
        match self.mode {
            CompositeMode::All => self.evaluate_all(candidate, env),
            CompositeMode::Any => self.evaluate_any(candidate, env),
        }
    }

    fn name(&self) -> &str {
        match self.mode {
            CompositeMode::All => "composite_all",
            CompositeMode::Any => "composite_any",
        }
    }
}

// ──────────────────── config-driven construction ────────────────────

/// Build the run policy from the config section.
pub fn policy_from_config(config: &PolicyConfig) -> Result<CompositePolicy> {
    let mode = match config.mode.as_str() {
        "any" => CompositeMode::Any,
        _ => CompositeMode::All,
    };
    let mut children: Vec<Box<dyn Policy>> = Vec::new();
    if let Some(days) = config.min_age_days {
        children.push(Box::new(AgePolicy::new(days)));
    }
    if let Some(mb) = config.min_size_mb {
        children.push(Box::new(SizePolicy::new(mb)));
    }
    if !config.extensions.is_empty() {
        children.push(Box::new(ExtensionPolicy::new(&config.extensions)));
    }
    if !config.exclude_globs.is_empty() {
        children.push(Box::new(ExclusionPolicy::new(&config.exclude_globs)?));
    }
    Ok(CompositePolicy::new(mode, children))
}

// ──────────────────── tests ────────────────────
