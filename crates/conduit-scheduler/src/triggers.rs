//! Trigger matching and evaluation.
//!
//! A job's `on:` list is a pure predicate over the run's trigger event,
//! evaluated once per template while the DAG is materialized.

use conduit_core::context::TriggerEvent;
use conduit_core::pipeline::{TriggerConfig, TriggerType};

/// Matcher for determining if a job runs for an event.
#[derive(Debug, Clone, Default)]
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// A job without triggers always runs; otherwise any matching trigger admits it.
    pub fn matches(&self, triggers: &[TriggerConfig], event: &TriggerEvent) -> bool {
        if triggers.is_empty() {
            return true;
        }
        triggers
            .iter()
            .any(|trigger| self.trigger_matches(trigger, event))
    }

    fn trigger_matches(&self, trigger: &TriggerConfig, event: &TriggerEvent) -> bool {
        if !self.event_matches(trigger, event.kind) {
            return false;
        }

        match event.kind {
            TriggerType::Tag => {
                let tag = event.tag.as_deref().unwrap_or_default();
                self.tag_matches(&trigger.tags, tag)
            }
            TriggerType::Push | TriggerType::PullRequest | TriggerType::Manual => {
                match event.branch.as_deref() {
                    Some(branch) => self.branch_matches(&trigger.branches, &trigger.branches_ignore, branch),
                    // A branch filter cannot admit an event without a branch.
                    None => trigger.branches.is_empty() || event.kind == TriggerType::Manual,
                }
            }
        }
    }

    fn event_matches(&self, trigger: &TriggerConfig, kind: TriggerType) -> bool {
        if !trigger.events.is_empty() {
            return trigger.events.contains(&kind);
        }
        // `tags:` on its own means "run for these tags".
        if !trigger.tags.is_empty() && trigger.branches.is_empty() {
            return kind == TriggerType::Tag;
        }
        true
    }

    fn branch_matches(&self, include: &[String], ignore: &[String], branch: &str) -> bool {
        if ignore.iter().any(|p| glob_match(p, branch)) {
            return false;
        }
        include.is_empty() || include.iter().any(|p| glob_match(p, branch))
    }

    fn tag_matches(&self, patterns: &[String], tag: &str) -> bool {
        patterns.is_empty() || patterns.iter().any(|p| glob_match(p, tag))
    }
}

/// Glob matching for branch and tag names.
///
/// `*` matches within one path segment, `**` matches across segments.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/**")
        && !prefix.contains('*')
    {
        return text == prefix || text.starts_with(&format!("{}/", prefix));
    }
    wildcard(pattern.as_bytes(), text.as_bytes())
}

fn wildcard(pattern: &[u8], text: &[u8]) -> bool {
    match pattern {
        [] => text.is_empty(),
        [b'*', b'*', rest @ ..] => (0..=text.len()).any(|i| wildcard(rest, &text[i..])),
        [b'*', rest @ ..] => {
            let segment = text.iter().position(|&c| c == b'/').unwrap_or(text.len());
            (0..=segment).any(|i| wildcard(rest, &text[i..]))
        }
        [c, rest @ ..] => text.first() == Some(c) && wildcard(rest, &text[1..]),
    }
}
