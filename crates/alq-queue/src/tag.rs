//! Whiteboard tag grammar.
//!
//! A landing request is flagged on a bug as, e.g.:
//!
//! ```text
//! [autoland-try]
//! [autoland-mozilla-central:10,11]
//! [autoland-mozilla-aurora,mozilla-beta:-p linux -u mochitests]
//! ```
//!
//! The branch list follows the `autoland-` prefix; up to two `:`-separated
//! parts follow, where a leading dash marks try syntax and digits mark
//! explicit attachment ids. The daemon rewrites accepted tags to the
//! canonical marker [`IN_QUEUE_MARKER`].

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Marker written back once a bug's work has been queued.
pub const IN_QUEUE_MARKER: &str = "[autoland-in-queue]";

/// Whiteboard search pattern handed to the tracker.
pub const SEARCH_PATTERN: &str = r"\[autoland.*\]";

/// Rewrite pattern matching any autoland tag.
pub const ANY_TAG_PATTERN: &str = r"\[autoland[^\[\]]*\]";

/// Rewrite pattern matching only the canonical in-queue marker.
pub const IN_QUEUE_PATTERN: &str = r"\[autoland-in-queue\]";

/// A parsed autoland tag. Ephemeral; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandingTag {
    /// Requested branch names, lowercased. Empty for a skeleton `[autoland]`.
    pub branches: Vec<String>,
    pub try_syntax: Option<String>,
    /// Explicitly requested attachment ids; empty means "all eligible".
    pub patches: Vec<i64>,
    /// The tag names already-accepted work and must be ignored.
    pub in_queue: bool,
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\[autoland(-[^\[\]:]+)?((:\d+(,\d+)*)|(:-[^\[\]:]+)){0,2}\]")
            .expect("tag regex must compile")
    })
}

fn branches_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\[autoland-([^:\]]+)").expect("branch regex must compile"))
}

/// Parse the first autoland tag in a whiteboard string.
pub fn parse_first(whiteboard: &str) -> Option<LandingTag> {
    let raw = tag_regex().find(whiteboard)?.as_str().to_lowercase();

    let branches = branches_regex()
        .captures(&raw)
        .map(|c| {
            c[1].split(',')
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let body = raw.trim_start_matches('[').trim_end_matches(']');
    let mut try_syntax = None;
    let mut patches = Vec::new();
    for part in body.split(':').skip(1) {
        let part = part.trim();
        if let Some(stripped) = part.strip_prefix('-') {
            if try_syntax.is_none() && !stripped.is_empty() {
                try_syntax = Some(part.to_string());
            }
        } else if part.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            // Malformed numeric tokens are silently dropped.
            patches = part.split(',').filter_map(|t| t.trim().parse().ok()).collect();
        }
    }

    Some(LandingTag {
        in_queue: raw.contains("in-queue"),
        branches,
        try_syntax,
        patches,
    })
}

impl fmt::Display for LandingTag {
    /// Canonical rendering; parsing then formatting a canonical tag is
    /// idempotent.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[autoland")?;
        if !self.branches.is_empty() {
            write!(f, "-{}", self.branches.join(","))?;
        }
        if !self.patches.is_empty() {
            let ids: Vec<String> = self.patches.iter().map(|p| p.to_string()).collect();
            write!(f, ":{}", ids.join(","))?;
        }
        if let Some(ref syntax) = self.try_syntax {
            write!(f, ":{syntax}")?;
        }
        write!(f, "]")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
