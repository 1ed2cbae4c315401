//! Field equivalence classification.
//!
//! Every field of an item type carries an [`EquivalenceClass`] deciding
//! whether and how it takes part in change detection, slow-sync matching
//! and conflict checks. Classes are ordered by relevance; comparing at a
//! level examines every field whose class is at least that level.

use crate::{error::Result, Error, Item, SyncOp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Relevance class of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquivalenceClass {
    /// Excluded from comparison and fingerprints (revision stamps)
    Never,
    /// Compared by a caller supplied hook instead of the equality loop
    Scripted,
    /// Must match when both sides changed
    Conflict,
    /// Must match to identify the same record during slow sync
    SlowSync,
    /// Must always match
    Always,
}

impl std::fmt::Display for EquivalenceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EquivalenceClass::Never => write!(f, "never"),
            EquivalenceClass::Scripted => write!(f, "scripted"),
            EquivalenceClass::Conflict => write!(f, "conflict"),
            EquivalenceClass::SlowSync => write!(f, "slowsync"),
            EquivalenceClass::Always => write!(f, "always"),
        }
    }
}

/// Supported datastore content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Contact,
    Event,
    Task,
    Memo,
}

impl ContentType {
    pub const ALL: [ContentType; 4] = [
        ContentType::Contact,
        ContentType::Event,
        ContentType::Task,
        ContentType::Memo,
    ];

    /// Default classifier for this content type.
    pub fn default_classifier(self) -> ItemClassifier {
        let classifier = ItemClassifier::new(self);
        match self {
            ContentType::Contact => classifier
                .with_field("REV", EquivalenceClass::Never)
                .with_field("N", EquivalenceClass::SlowSync)
                .with_field("FN", EquivalenceClass::SlowSync),
            ContentType::Event => classifier
                .with_field("DTSTAMP", EquivalenceClass::Never)
                .with_field("LAST-MODIFIED", EquivalenceClass::Never)
                .with_field("SEQUENCE", EquivalenceClass::Never)
                .with_field("SUMMARY", EquivalenceClass::SlowSync)
                .with_field("DTSTART", EquivalenceClass::SlowSync),
            ContentType::Task => classifier
                .with_field("DTSTAMP", EquivalenceClass::Never)
                .with_field("LAST-MODIFIED", EquivalenceClass::Never)
                .with_field("SUMMARY", EquivalenceClass::SlowSync),
            ContentType::Memo => classifier
                .with_field("LAST-MODIFIED", EquivalenceClass::Never)
                .with_field("SUMMARY", EquivalenceClass::SlowSync),
        }
    }

    /// Whether a safe merge may take fields the local copy lacks from the
    /// remote copy. Memos are a single body and are never merged.
    pub fn merges_missing_fields(self) -> bool {
        !matches!(self, ContentType::Memo)
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentType::Contact => write!(f, "contact"),
            ContentType::Event => write!(f, "event"),
            ContentType::Task => write!(f, "task"),
            ContentType::Memo => write!(f, "memo"),
        }
    }
}

/// Hook comparing a `Scripted` field: `(field, a, b, level) -> equal`.
pub type ScriptedCompare<'a> =
    &'a dyn Fn(&str, Option<&Value>, Option<&Value>, EquivalenceClass) -> bool;

/// Owned form of [`ScriptedCompare`], shared across sessions.
pub type ScriptedHook =
    Arc<dyn Fn(&str, Option<&Value>, Option<&Value>, EquivalenceClass) -> bool + Send + Sync>;

/// A field that differed during a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMismatch {
    pub field: String,
    pub class: EquivalenceClass,
}

/// Outcome of comparing two items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOutcome {
    Match,
    Mismatch,
    /// One side is tagged for deletion, nothing was compared
    Skipped,
}

/// Result of [`ItemClassifier::compare`], with every mismatch found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub outcome: CompareOutcome,
    pub mismatches: Vec<FieldMismatch>,
}

impl Comparison {
    pub fn is_match(&self) -> bool {
        self.outcome == CompareOutcome::Match
    }

    /// Names of the mismatching fields.
    pub fn fields(&self) -> Vec<&str> {
        self.mismatches.iter().map(|m| m.field.as_str()).collect()
    }
}

/// Static per content type classification table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemClassifier {
    pub content_type: ContentType,
    /// Explicit classes by field name
    pub fields: HashMap<String, EquivalenceClass>,
    /// Class of fields not listed in `fields`
    pub default_class: EquivalenceClass,
}

impl ItemClassifier {
    /// Create an empty classifier; unlisted fields are `Conflict`.
    pub fn new(content_type: ContentType) -> Self {
        Self {
            content_type,
            fields: HashMap::new(),
            default_class: EquivalenceClass::Conflict,
        }
    }

    /// Builder-style method to classify a field.
    pub fn with_field(mut self, name: impl Into<String>, class: EquivalenceClass) -> Self {
        self.fields.insert(name.into(), class);
        self
    }

    /// Builder-style method to set the class of unlisted fields.
    pub fn with_default_class(mut self, class: EquivalenceClass) -> Self {
        self.default_class = class;
        self
    }

    pub fn classify(&self, field: &str) -> EquivalenceClass {
        self.fields
            .get(field)
            .copied()
            .unwrap_or(self.default_class)
    }

    /// Whether any field may be `Scripted`.
    pub fn has_scripted_fields(&self) -> bool {
        self.default_class == EquivalenceClass::Scripted
            || self
                .fields
                .values()
                .any(|c| *c == EquivalenceClass::Scripted)
    }

    /// Class used by the comparison loop: scripted fields without a hook
    /// behave as `Always`.
    fn effective_class(&self, field: &str, hooked: bool) -> EquivalenceClass {
        match self.classify(field) {
            EquivalenceClass::Scripted if !hooked => EquivalenceClass::Always,
            class => class,
        }
    }

    /// Compare two items at the given level.
    ///
    /// Fields are walked in name order. An `Always` mismatch ends the walk
    /// immediately; every other mismatch is collected so a conflict can be
    /// explained field by field. Null values count as absent.
    pub fn compare(
        &self,
        a: &Item,
        b: &Item,
        level: EquivalenceClass,
        hook: Option<ScriptedCompare<'_>>,
    ) -> Comparison {
        if a.operation() == SyncOp::Delete || b.operation() == SyncOp::Delete {
            return Comparison {
                outcome: CompareOutcome::Skipped,
                mismatches: Vec::new(),
            };
        }

        let names: BTreeSet<&String> = a.fields.keys().chain(b.fields.keys()).collect();
        let mut mismatches = Vec::new();

        for name in names {
            let class = self.effective_class(name, hook.is_some());
            if class == EquivalenceClass::Never {
                continue;
            }
            if class != EquivalenceClass::Scripted && class < level {
                continue;
            }

            let left = present(a.field(name));
            let right = present(b.field(name));
            let equal = match (class, hook) {
                (EquivalenceClass::Scripted, Some(hook)) => hook(name.as_str(), left, right, level),
                _ => left == right,
            };

            if !equal {
                mismatches.push(FieldMismatch {
                    field: name.clone(),
                    class,
                });
                if class == EquivalenceClass::Always {
                    break;
                }
            }
        }

        Comparison {
            outcome: if mismatches.is_empty() {
                CompareOutcome::Match
            } else {
                CompareOutcome::Mismatch
            },
            mismatches,
        }
    }

    /// Canonical key over all fields relevant at `level`.
    ///
    /// Two items produce the same key exactly when [`compare`](Self::compare)
    /// without a hook reports a match at that level, which lets slow sync
    /// index candidates instead of comparing every pair.
    pub fn match_key(&self, item: &Item, level: EquivalenceClass) -> String {
        let relevant: Map<String, Value> = item
            .fields()
            .filter(|(_, v)| !v.is_null())
            .filter(|(name, _)| {
                let class = self.effective_class(name, false);
                class != EquivalenceClass::Never && class >= level
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(relevant).to_string()
    }

    /// Merge for two copies whose conflict-relevant fields agree.
    ///
    /// The local copy wins; fields it left absent are taken from the remote
    /// copy unless the content type forbids merging.
    pub fn merge(&self, local: &Item, remote: &Item) -> Item {
        let mut merged = local.clone();
        if !self.content_type.merges_missing_fields() {
            return merged;
        }
        for (name, value) in remote.fields() {
            if present(merged.field(name)).is_none() && !value.is_null() {
                merged.set_field(name.clone(), value.clone());
            }
        }
        merged
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

/// Session scoped lookup of classifiers by content type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierRegistry {
    classifiers: HashMap<ContentType, ItemClassifier>,
}

impl ClassifierRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the default classifier of every content type.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for content_type in ContentType::ALL {
            registry.register(content_type.default_classifier());
        }
        registry
    }

    /// Register a classifier, replacing any previous one for its type.
    pub fn register(&mut self, classifier: ItemClassifier) -> &mut Self {
        self.classifiers
            .insert(classifier.content_type, classifier);
        self
    }

    /// Builder-style method to register a classifier.
    pub fn with_classifier(mut self, classifier: ItemClassifier) -> Self {
        self.register(classifier);
        self
    }

    pub fn get(&self, content_type: ContentType) -> Result<&ItemClassifier> {
        self.classifiers
            .get(&content_type)
            .ok_or_else(|| Error::UnknownContentType(content_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classifier() -> ItemClassifier {
        ItemClassifier::new(ContentType::Contact)
            .with_field("REV", EquivalenceClass::Never)
            .with_field("FN", EquivalenceClass::SlowSync)
            .with_field("UID", EquivalenceClass::Always)
            .with_field("NOTE", EquivalenceClass::Conflict)
    }

    fn item(value: Value) -> Item {
        Item::from_json(ContentType::Contact, value)
    }

    #[test]
    fn classify_known_and_unknown_fields() {
        let c = classifier();
        assert_eq!(c.classify("REV"), EquivalenceClass::Never);
        assert_eq!(c.classify("FN"), EquivalenceClass::SlowSync);
        assert_eq!(c.classify("EMAIL"), EquivalenceClass::Conflict);

        let c = c.with_default_class(EquivalenceClass::Never);
        assert_eq!(c.classify("EMAIL"), EquivalenceClass::Never);
    }

    #[test]
    fn class_ordering() {
        assert!(EquivalenceClass::Never < EquivalenceClass::Scripted);
        assert!(EquivalenceClass::Scripted < EquivalenceClass::Conflict);
        assert!(EquivalenceClass::Conflict < EquivalenceClass::SlowSync);
        assert!(EquivalenceClass::SlowSync < EquivalenceClass::Always);
    }

    #[test]
    fn never_fields_are_ignored() {
        let a = item(json!({"FN": "Alice", "REV": "1"}));
        let b = item(json!({"FN": "Alice", "REV": "2"}));
        let result = classifier().compare(&a, &b, EquivalenceClass::Conflict, None);
        assert!(result.is_match());
    }

    #[test]
    fn level_filters_lower_classes() {
        let a = item(json!({"FN": "Alice", "NOTE": "x"}));
        let b = item(json!({"FN": "Alice", "NOTE": "y"}));
        let c = classifier();

        assert!(c.compare(&a, &b, EquivalenceClass::SlowSync, None).is_match());
        let result = c.compare(&a, &b, EquivalenceClass::Conflict, None);
        assert_eq!(result.outcome, CompareOutcome::Mismatch);
        assert_eq!(result.fields(), vec!["NOTE"]);
    }

    #[test]
    fn conflict_mismatches_accumulate() {
        let a = item(json!({"FN": "Alice", "NOTE": "x", "EMAIL": "a@x"}));
        let b = item(json!({"FN": "Alicia", "NOTE": "y", "EMAIL": "a@y"}));
        let result = classifier().compare(&a, &b, EquivalenceClass::Conflict, None);
        assert_eq!(result.fields(), vec!["EMAIL", "FN", "NOTE"]);
    }

    #[test]
    fn always_mismatch_short_circuits() {
        // "EMAIL" sorts before "UID"; "ZIP" after it is never reached
        let a = item(json!({"EMAIL": "a", "UID": "1", "ZIP": "1"}));
        let b = item(json!({"EMAIL": "b", "UID": "2", "ZIP": "2"}));
        let result = classifier().compare(&a, &b, EquivalenceClass::Conflict, None);

        assert_eq!(result.outcome, CompareOutcome::Mismatch);
        assert_eq!(result.fields(), vec!["EMAIL", "UID"]);
        assert_eq!(result.mismatches[1].class, EquivalenceClass::Always);
    }

    #[test]
    fn null_counts_as_absent() {
        let a = item(json!({"FN": "Alice", "NOTE": null}));
        let b = item(json!({"FN": "Alice"}));
        assert!(classifier()
            .compare(&a, &b, EquivalenceClass::Conflict, None)
            .is_match());
    }

    #[test]
    fn scripted_uses_hook() {
        let c = ItemClassifier::new(ContentType::Contact)
            .with_field("TEL", EquivalenceClass::Scripted);
        let a = item(json!({"TEL": "+1 555 0100"}));
        let b = item(json!({"TEL": "15550100"}));

        let digits = |v: Option<&Value>| -> String {
            v.and_then(Value::as_str)
                .unwrap_or_default()
                .chars()
                .filter(char::is_ascii_digit)
                .collect()
        };
        let hook: ScriptedCompare<'_> = &|_, x, y, _| digits(x) == digits(y);

        assert!(c
            .compare(&a, &b, EquivalenceClass::SlowSync, Some(hook))
            .is_match());
    }

    #[test]
    fn scripted_without_hook_acts_as_always() {
        let c = ItemClassifier::new(ContentType::Contact)
            .with_field("TEL", EquivalenceClass::Scripted)
            .with_field("NOTE", EquivalenceClass::Conflict);
        let a = item(json!({"TEL": "1", "NOTE": "a"}));
        let b = item(json!({"TEL": "2", "NOTE": "b"}));

        let result = c.compare(&a, &b, EquivalenceClass::Always, None);
        assert_eq!(
            result.mismatches,
            vec![FieldMismatch {
                field: "TEL".into(),
                class: EquivalenceClass::Always
            }]
        );
    }

    #[test]
    fn deleted_items_are_not_compared() {
        let mut a = item(json!({"FN": "Alice"}));
        let b = item(json!({"FN": "Bob"}));
        a.set_operation(SyncOp::Delete);

        let result = classifier().compare(&a, &b, EquivalenceClass::Conflict, None);
        assert_eq!(result.outcome, CompareOutcome::Skipped);
        assert!(result.mismatches.is_empty());
    }

    #[test]
    fn match_key_agrees_with_compare() {
        let c = classifier();
        let a = item(json!({"FN": "Alice", "NOTE": "x", "REV": "1"}));
        let b = item(json!({"FN": "Alice", "NOTE": "y", "REV": "2"}));
        let d = item(json!({"FN": "Bob"}));

        assert_eq!(
            c.match_key(&a, EquivalenceClass::SlowSync),
            c.match_key(&b, EquivalenceClass::SlowSync)
        );
        assert_ne!(
            c.match_key(&a, EquivalenceClass::SlowSync),
            c.match_key(&d, EquivalenceClass::SlowSync)
        );
    }

    #[test]
    fn merge_fills_missing_fields() {
        let c = classifier();
        let local = item(json!({"FN": "Alice", "NOTE": "local"})).with_local_id("l-1");
        let remote = item(json!({"FN": "Alice", "NOTE": "remote", "EMAIL": "a@x"}));

        let merged = c.merge(&local, &remote);
        assert_eq!(merged.local_id.as_deref(), Some("l-1"));
        assert_eq!(merged.field("NOTE"), Some(&json!("local")));
        assert_eq!(merged.field("EMAIL"), Some(&json!("a@x")));
    }

    #[test]
    fn memos_do_not_merge() {
        let c = ContentType::Memo.default_classifier();
        let local = Item::from_json(ContentType::Memo, json!({"SUMMARY": "a"}));
        let remote = Item::from_json(ContentType::Memo, json!({"SUMMARY": "a", "BODY": "b"}));
        assert_eq!(c.merge(&local, &remote), local);
    }

    #[test]
    fn registry_lookup() {
        let registry = ClassifierRegistry::with_defaults();
        let contact = registry.get(ContentType::Contact).unwrap();
        assert_eq!(contact.classify("REV"), EquivalenceClass::Never);

        let empty = ClassifierRegistry::new();
        assert!(matches!(
            empty.get(ContentType::Event),
            Err(Error::UnknownContentType(t)) if t == "event"
        ));
    }

    #[test]
    fn classifier_serialization() {
        let c = classifier();
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"defaultClass\":\"conflict\""));
        let parsed: ItemClassifier = serde_json::from_str(&json).unwrap();
        assert_eq!(c, parsed);
    }
}
