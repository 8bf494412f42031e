//! Attraction/repulsion rules evaluated by a field.
//!
//! A rule is `(subject pattern, verb, object pattern)`. Rules are ordered and
//! the first rule matching the pair (in either orientation) decides. No match
//! means the pair is allowed.

use crate::resource::{ResourceCategory, ResourceData};
use crate::types::ResourceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which resources a rule side applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", content = "value", rename_all = "snake_case")]
pub enum Pattern {
    Any,
    Resource(ResourceId),
    Category(ResourceCategory),
    Tag(String),
}

impl Pattern {
    pub(crate) fn matches(&self, subject: &RuleSubject<'_>) -> bool {
        match self {
            Self::Any => true,
            Self::Resource(id) => *id == subject.id,
            Self::Category(category) => category == subject.category,
            Self::Tag(tag) => subject.tags.contains(tag),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleVerb {
    Attract,
    Repel,
}

/// A single ordered rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub name: String,
    pub subject: Pattern,
    pub verb: RuleVerb,
    pub object: Pattern,
}

impl FieldRule {
    pub fn new(name: impl Into<String>, subject: Pattern, verb: RuleVerb, object: Pattern) -> Self {
        Self {
            name: name.into(),
            subject,
            verb,
            object,
        }
    }

    pub fn repel(name: impl Into<String>, subject: Pattern, object: Pattern) -> Self {
        Self::new(name, subject, RuleVerb::Repel, object)
    }

    pub fn attract(name: impl Into<String>, subject: Pattern, object: Pattern) -> Self {
        Self::new(name, subject, RuleVerb::Attract, object)
    }

    fn applies(&self, a: &RuleSubject<'_>, b: &RuleSubject<'_>) -> bool {
        (self.subject.matches(a) && self.object.matches(b))
            || (self.subject.matches(b) && self.object.matches(a))
    }
}

/// What a rule side is matched against.
pub(crate) struct RuleSubject<'a> {
    pub id: ResourceId,
    pub category: &'a ResourceCategory,
    pub tags: &'a BTreeSet<String>,
}

impl<'a> From<&'a ResourceData> for RuleSubject<'a> {
    fn from(data: &'a ResourceData) -> Self {
        Self {
            id: data.id,
            category: &data.category,
            tags: &data.metadata.tags,
        }
    }
}

/// Ordered rule list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    rules: Vec<FieldRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rule: FieldRule) {
        self.rules.push(rule);
    }

    /// Remove every rule with this name. Returns how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.rules.len();
        self.rules.retain(|r| r.name != name);
        before - self.rules.len()
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First matching rule for the pair, if any.
    pub(crate) fn evaluate(&self, a: &RuleSubject<'_>, b: &RuleSubject<'_>) -> Option<&FieldRule> {
        self.rules.iter().find(|rule| rule.applies(a, b))
    }
}

impl FromIterator<FieldRule> for RuleSet {
    fn from_iter<T: IntoIterator<Item = FieldRule>>(iter: T) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject<'a>(
        id: ResourceId,
        category: &'a ResourceCategory,
        tags: &'a BTreeSet<String>,
    ) -> RuleSubject<'a> {
        RuleSubject { id, category, tags }
    }

    #[test]
    fn test_first_match_wins() {
        let tool = ResourceCategory::Tool;
        let model = ResourceCategory::Model;
        let no_tags = BTreeSet::new();
        let t = ResourceId::new();
        let m = ResourceId::new();

        let rules: RuleSet = vec![
            FieldRule::attract("allow-this-model", Pattern::Resource(m), Pattern::Any),
            FieldRule::repel("no-models-on-tools", Pattern::Category(model.clone()), Pattern::Category(tool.clone())),
        ]
        .into_iter()
        .collect();

        let hit = rules
            .evaluate(&subject(t, &tool, &no_tags), &subject(m, &model, &no_tags))
            .unwrap();
        assert_eq!(hit.verb, RuleVerb::Attract);

        let other = ResourceId::new();
        let hit = rules
            .evaluate(&subject(t, &tool, &no_tags), &subject(other, &model, &no_tags))
            .unwrap();
        assert_eq!(hit.verb, RuleVerb::Repel);
    }

    #[test]
    fn test_tag_pattern_and_no_match() {
        let data = ResourceCategory::Data;
        let mut secret = BTreeSet::new();
        secret.insert("secret".to_string());
        let plain = BTreeSet::new();

        let rules: RuleSet = std::iter::once(FieldRule::repel(
            "secret-isolation",
            Pattern::Tag("secret".into()),
            Pattern::Any,
        ))
        .collect();

        let a = subject(ResourceId::new(), &data, &plain);
        let b = subject(ResourceId::new(), &data, &secret);
        assert!(rules.evaluate(&a, &b).is_some());

        let c = subject(ResourceId::new(), &data, &plain);
        assert!(rules.evaluate(&a, &c).is_none());
    }

    #[test]
    fn test_remove_by_name() {
        let mut rules = RuleSet::new();
        rules.push(FieldRule::attract("y", Pattern::Any, Pattern::Any));
        rules.push(FieldRule::repel("x", Pattern::Any, Pattern::Any));
        assert_eq!(rules.rules()[0].name, "y");
        assert_eq!(rules.remove("x"), 1);
        assert_eq!(rules.len(), 1);
    }
}
