use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::matcher::label::SLASH;
use crate::matcher::{DomainTrie, Matcher, ResolverHook};
use crate::parser::read_pattern_file;
use crate::process::normalize_process_path;
use crate::types::{Host, ModeDecision, PatternKind, TextRule};

/// Immutable snapshot of one rule source.
///
/// Built once by [`RuleSetBuilder`] and then only read; reloads build a new
/// set and swap it in.
#[derive(Debug, Clone)]
pub struct RuleSet {
    matcher: Matcher<Arc<ModeDecision>>,
    processes: DomainTrie<Arc<ModeDecision>>,
    tags: BTreeSet<String>,
    rule_count: usize,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl RuleSet {
    pub fn empty() -> Self {
        Self {
            matcher: Matcher::new(),
            processes: DomainTrie::with_separator(SLASH),
            tags: BTreeSet::new(),
            rule_count: 0,
        }
    }

    /// Match a destination host, optionally retrying resolved IPs against
    /// the prefix rules.
    pub fn search(&self, host: &Host, hook: Option<ResolverHook<'_>>) -> Option<&Arc<ModeDecision>> {
        self.matcher.search(host, hook)
    }

    /// Match an executable path. The path is normalised the same way rule
    /// patterns are.
    pub fn search_process(&self, path: &str) -> Option<&Arc<ModeDecision>> {
        let path = normalize_process_path(path);
        if path.is_empty() {
            return None;
        }
        self.processes.search(&path)
    }

    /// Tags referenced by any rule in the set.
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn needs_ip_matching(&self) -> bool {
        self.matcher.needs_ip_matching()
    }

    /// Number of patterns inserted.
    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    pub fn is_empty(&self) -> bool {
        self.rule_count == 0
    }
}

/// Builds a [`RuleSet`], sharing one allocation between equal decisions.
#[derive(Debug, Default)]
pub struct RuleSetBuilder {
    set: RuleSet,
    interned: HashMap<ModeDecision, Arc<ModeDecision>>,
}

impl RuleSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle for a decision value.
    pub fn intern(&mut self, decision: ModeDecision) -> Arc<ModeDecision> {
        if let Some(shared) = self.interned.get(&decision) {
            return shared.clone();
        }
        let shared = Arc::new(decision.clone());
        self.interned.insert(decision, shared.clone());
        shared
    }

    /// Add one parsed rule.
    pub fn add_rule(&mut self, rule: &TextRule) {
        let decision = self.intern(rule.decision.clone());
        self.insert(rule.kind, &rule.pattern, decision);
    }

    /// Insert a pattern. Bad patterns are logged and skipped.
    pub fn insert(&mut self, kind: PatternKind, pattern: &str, decision: Arc<ModeDecision>) {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return;
        }

        match kind {
            PatternKind::File => match read_pattern_file(pattern) {
                Ok(patterns) => {
                    for (kind, pattern) in patterns {
                        self.insert(kind, &pattern, decision.clone());
                    }
                }
                Err(e) => warn!(path = pattern, error = %e, "skipping pattern file"),
            },
            PatternKind::Process => {
                let path = normalize_process_path(pattern);
                if path.is_empty() {
                    return;
                }
                self.note_tag(&decision);
                self.set.processes.insert(&path, decision);
                self.set.rule_count += 1;
            }
            PatternKind::Host => match self.set.matcher.insert(pattern, decision.clone()) {
                Ok(_) => {
                    self.note_tag(&decision);
                    self.set.rule_count += 1;
                }
                Err(e) => debug!(pattern, error = %e, "skipping pattern"),
            },
        }
    }

    fn note_tag(&mut self, decision: &ModeDecision) {
        if let Some(tag) = decision.tag() {
            self.set.tags.insert(tag.to_string());
        }
    }

    pub fn build(self) -> RuleSet {
        self.set
    }
}

/// Compile parsed rules into a rule set.
pub fn compile(rules: &[TextRule]) -> RuleSet {
    let mut builder = RuleSetBuilder::new();
    for rule in rules {
        builder.add_rule(rule);
    }
    builder.build()
}
