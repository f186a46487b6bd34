use async_trait::async_trait;
use feature_lock_core::{FeatureStore, Predicate, Query, ResolutionError};
use tracing::{debug, instrument};

/// Feature store for callers that already know their record ids.
///
/// The lock store has no access to feature data, so only resource id
/// queries can be resolved; the ids are taken as given, duplicates and all.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdResolver;

impl IdResolver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FeatureStore for IdResolver {
    #[instrument(skip(self), level = "debug")]
    async fn resolve(&self, query: &Query) -> Result<Vec<String>, ResolutionError> {
        match &query.predicate {
            Predicate::ResourceIds(ids) => {
                debug!("Resolved {} ids for {}", ids.len(), query.record_type);
                Ok(ids.clone())
            }
            Predicate::All => Err(ResolutionError::UnsupportedPredicate(format!(
                "all records of {}",
                query.record_type
            ))),
            Predicate::Expression(expression) => {
                Err(ResolutionError::UnsupportedPredicate(expression.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resource_ids_pass_through() {
        let resolver = IdResolver::new();
        let ids = resolver
            .resolve(&Query::ids("Road", ["R2", "R1"]))
            .await
            .unwrap();
        assert_eq!(ids, vec!["R2", "R1"]);
    }

    #[tokio::test]
    async fn test_other_predicates_unsupported() {
        let resolver = IdResolver::new();
        for predicate in [Predicate::All, Predicate::Expression("lanes > 2".into())] {
            let err = resolver
                .resolve(&Query::new("Road", predicate))
                .await
                .unwrap_err();
            assert!(matches!(err, ResolutionError::UnsupportedPredicate(_)));
        }
    }
}
