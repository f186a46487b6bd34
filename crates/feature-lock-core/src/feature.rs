use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::ResolutionError;

/// Selection of records within a record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Predicate {
    /// Every record of the type.
    All,
    /// Explicit record ids (a resource id filter).
    ResourceIds(Vec<String>),
    /// An opaque filter expression, evaluated by the feature store.
    Expression(String),
}

/// A predicate scoped to one record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub record_type: String,
    pub predicate: Predicate,
}

impl Query {
    pub fn new(record_type: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            record_type: record_type.into(),
            predicate,
        }
    }

    /// Query for explicit record ids.
    pub fn ids<I, S>(record_type: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            record_type,
            Predicate::ResourceIds(ids.into_iter().map(Into::into).collect()),
        )
    }
}

/// The external store that turns a query into concrete record ids.
///
/// Predicate evaluation (spatial filters, property comparisons) lives behind
/// this trait; the lock manager only needs the resulting ids.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Resolve `query` to an ordered list of record ids.
    async fn resolve(&self, query: &Query) -> Result<Vec<String>, ResolutionError>;
}

#[derive(Debug, Default)]
struct RecordTypeEntry {
    /// Record ids in insertion order
    ids: Vec<String>,
    /// Named expressions -> matching ids
    expressions: HashMap<String, Vec<String>>,
}

/// In-memory feature store.
///
/// Resolves `All` and `ResourceIds` against registered ids, and
/// `Expression` only for expressions registered with `define`.
#[derive(Debug, Default)]
pub struct MemoryFeatureStore {
    types: DashMap<String, RecordTypeEntry>,
}

impl MemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register record ids for a record type.
    pub fn insert<I, S>(&self, record_type: &str, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entry = self.types.entry(record_type.to_string()).or_default();
        for id in ids {
            let id = id.into();
            if !entry.ids.contains(&id) {
                entry.ids.push(id);
            }
        }
    }

    /// Register the ids an expression evaluates to.
    pub fn define<I, S>(&self, record_type: &str, expression: &str, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        self.insert(record_type, ids.iter().cloned());
        if let Some(mut entry) = self.types.get_mut(record_type) {
            entry.expressions.insert(expression.to_string(), ids);
        }
    }
}

#[async_trait]
impl FeatureStore for MemoryFeatureStore {
    #[instrument(skip(self), level = "debug")]
    async fn resolve(&self, query: &Query) -> Result<Vec<String>, ResolutionError> {
        let entry = self
            .types
            .get(&query.record_type)
            .ok_or_else(|| ResolutionError::UnknownRecordType(query.record_type.clone()))?;

        let ids = match &query.predicate {
            Predicate::All => entry.ids.clone(),
            Predicate::ResourceIds(requested) => {
                let known: HashSet<&str> = entry.ids.iter().map(String::as_str).collect();
                requested
                    .iter()
                    .filter(|id| known.contains(id.as_str()))
                    .cloned()
                    .collect()
            }
            Predicate::Expression(expression) => entry
                .expressions
                .get(expression)
                .cloned()
                .ok_or_else(|| ResolutionError::UnsupportedPredicate(expression.clone()))?,
        };

        debug!("Resolved {} ids for {}", ids.len(), query.record_type);
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_predicates() {
        let features = MemoryFeatureStore::new();
        features.insert("Road", ["R1", "R2", "R3"]);
        features.define("Road", "lanes > 2", ["R3", "R1"]);

        let all = features.resolve(&Query::new("Road", Predicate::All)).await.unwrap();
        assert_eq!(all, vec!["R1", "R2", "R3"]);

        let by_id = features.resolve(&Query::ids("Road", ["R2", "R9"])).await.unwrap();
        assert_eq!(by_id, vec!["R2"]);

        let by_expr = features
            .resolve(&Query::new("Road", Predicate::Expression("lanes > 2".into())))
            .await
            .unwrap();
        assert_eq!(by_expr, vec!["R3", "R1"]);
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let features = MemoryFeatureStore::new();
        features.insert("Road", ["R1"]);

        let err = features.resolve(&Query::ids("River", ["R1"])).await.unwrap_err();
        assert_eq!(err, ResolutionError::UnknownRecordType("River".into()));

        let err = features
            .resolve(&Query::new("Road", Predicate::Expression("bogus".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::UnsupportedPredicate(_)));
    }

    #[test]
    fn test_predicate_serde() {
        let query = Query::ids("Road", ["R1"]);
        let json = serde_json::to_string(&query).unwrap();
        assert_eq!(
            json,
            r#"{"record_type":"Road","predicate":{"kind":"resource_ids","value":["R1"]}}"#
        );
        let back: Query = serde_json::from_str(&json).unwrap();
        assert_eq!(back, query);
    }
}
