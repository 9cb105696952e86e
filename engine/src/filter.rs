//! Selective sync filters.
//!
//! A [`SyncFilter`] is a named set of `{field, op, value}` rules scoped to
//! zero or more collections (none means every collection). Rules within a
//! filter are AND'd; several filters on the same collection are OR'd. A
//! collection that no filter targets syncs everything.
//!
//! Field paths use dots (`owner.team.id`) and resolve by descending one
//! hop at a time. A missing hop makes the value undefined, which every
//! operator handles without failing.

use crate::{ChangeRecord, CollectionName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Comparison applied by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Contains,
    StartsWith,
    EndsWith,
    Exists,
}

/// A single predicate on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFilterRule {
    pub field: String,
    pub op: FilterOperator,
    #[serde(default)]
    pub value: Value,
}

impl SyncFilterRule {
    pub fn new(field: impl Into<String>, op: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// Evaluate against a document. Never fails.
    pub fn matches(&self, document: &Value) -> bool {
        let field = resolve_path(document, &self.field);
        let target = &self.value;

        match self.op {
            FilterOperator::Eq => field == Some(target),
            FilterOperator::Ne => field != Some(target),
            FilterOperator::Gt => compare_values(field, target) == Some(Ordering::Greater),
            FilterOperator::Gte => matches!(
                compare_values(field, target),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lt => compare_values(field, target) == Some(Ordering::Less),
            FilterOperator::Lte => matches!(
                compare_values(field, target),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::In => match (field, target) {
                (Some(fv), Value::Array(options)) => options.contains(fv),
                _ => false,
            },
            FilterOperator::Nin => match (field, target) {
                (Some(fv), Value::Array(options)) => !options.contains(fv),
                _ => true,
            },
            FilterOperator::Contains => match (field, target) {
                (Some(Value::String(fv)), Value::String(needle)) => fv.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => items.contains(needle),
                _ => false,
            },
            FilterOperator::StartsWith => match (field, target) {
                (Some(Value::String(fv)), Value::String(prefix)) => fv.starts_with(prefix.as_str()),
                _ => false,
            },
            FilterOperator::EndsWith => match (field, target) {
                (Some(Value::String(fv)), Value::String(suffix)) => fv.ends_with(suffix.as_str()),
                _ => false,
            },
            // Only a literal `true` asks for presence.
            FilterOperator::Exists => field.is_some() == (*target == Value::Bool(true)),
        }
    }
}

/// Resolve a dotted path. Any missing hop yields `None`.
pub fn resolve_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = document;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn compare_values(field: Option<&Value>, target: &Value) -> Option<Ordering> {
    match (field?, target) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// A named rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFilter {
    pub name: String,
    /// Collections the filter applies to; empty means all
    #[serde(default)]
    pub collections: Vec<CollectionName>,
    #[serde(default)]
    pub rules: Vec<SyncFilterRule>,
}

impl SyncFilter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collections: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn for_collection(mut self, collection: impl Into<CollectionName>) -> Self {
        self.collections.push(collection.into());
        self
    }

    pub fn rule(mut self, field: impl Into<String>, op: FilterOperator, value: Value) -> Self {
        self.rules.push(SyncFilterRule::new(field, op, value));
        self
    }

    pub fn applies_to(&self, collection: &str) -> bool {
        self.collections.is_empty() || self.collections.iter().any(|c| c == collection)
    }

    /// All rules must hold.
    pub fn matches(&self, document: &Value) -> bool {
        self.rules.iter().all(|r| r.matches(document))
    }
}

/// Result of evaluating the filter set for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterDecision {
    pub should_sync: bool,
    /// Name of the first filter that admitted the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_filter: Option<String>,
}

impl FilterDecision {
    fn allow(matched_filter: Option<String>) -> Self {
        Self {
            should_sync: true,
            matched_filter,
        }
    }

    fn deny() -> Self {
        Self {
            should_sync: false,
            matched_filter: None,
        }
    }
}

/// The configured set of filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectiveSync {
    filters: BTreeMap<String, SyncFilter>,
}

impl SelectiveSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_filters(filters: impl IntoIterator<Item = SyncFilter>) -> Self {
        let mut selective = Self::new();
        for filter in filters {
            selective.add_filter(filter);
        }
        selective
    }

    /// Add or replace a filter by name.
    pub fn add_filter(&mut self, filter: SyncFilter) -> Option<SyncFilter> {
        self.filters.insert(filter.name.clone(), filter)
    }

    pub fn remove_filter(&mut self, name: &str) -> Option<SyncFilter> {
        self.filters.remove(name)
    }

    pub fn filters(&self) -> impl Iterator<Item = &SyncFilter> {
        self.filters.values()
    }

    /// Filters that target a collection.
    pub fn filters_for<'a>(&'a self, collection: &'a str) -> impl Iterator<Item = &'a SyncFilter> {
        self.filters.values().filter(move |f| f.applies_to(collection))
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Decide whether a document is in scope.
    pub fn evaluate(&self, collection: &str, document: &Value) -> FilterDecision {
        let mut targeted = false;
        for filter in self.filters_for(collection) {
            targeted = true;
            if filter.matches(document) {
                return FilterDecision::allow(Some(filter.name.clone()));
            }
        }

        if targeted {
            FilterDecision::deny()
        } else {
            FilterDecision::allow(None)
        }
    }

    pub fn should_sync(&self, collection: &str, document: &Value) -> bool {
        self.evaluate(collection, document).should_sync
    }

    /// Decide whether a change is in scope. Deletes carry no document and
    /// always pass so removals are never lost.
    pub fn should_sync_change(&self, change: &ChangeRecord) -> bool {
        match &change.document {
            Some(document) => self.should_sync(&change.collection, document),
            None => true,
        }
    }
}
