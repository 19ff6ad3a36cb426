use std::sync::Arc;
use thiserror::Error;

use super::executor::{ExecutorError, ParticipantRow, QueryExecutor, RowParseError};
use crate::error::CompileError;
use crate::query::{
    CodesQueryCompiler, CohortQueryCompiler, ConceptScope, ParticipantCountCompiler,
    ParticipantCountQuery, QueryParameters, SearchRequest,
};
use crate::registry::DomainRegistry;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("warehouse query failed: {0}")]
    Warehouse(#[source] ExecutorError),

    #[error(transparent)]
    MalformedRow(#[from] RowParseError),
}

impl SearchError {
    /// Whether the failure was caused by the caller's criteria.
    pub fn is_client_error(&self) -> bool {
        matches!(self, SearchError::Compile(_))
    }
}

/// Compiles criteria and runs them through a [`QueryExecutor`].
///
/// Invalid criteria and empty concept sets never reach the executor.
pub struct CohortSearch<E> {
    registry: Arc<DomainRegistry>,
    executor: E,
}

impl<E: QueryExecutor> CohortSearch<E> {
    pub fn new(registry: Arc<DomainRegistry>, executor: E) -> Self {
        Self { registry, executor }
    }

    pub fn registry(&self) -> &DomainRegistry {
        &self.registry
    }

    /// Persons matching any of the codes, with their demographics.
    pub async fn find_participants(
        &self,
        params: &QueryParameters,
    ) -> Result<Vec<ParticipantRow>, SearchError> {
        let query = CodesQueryCompiler::new(&self.registry).build(params)?;
        let values = self
            .executor
            .query_values(&query)
            .await
            .map_err(SearchError::Warehouse)?;

        let rows = values
            .iter()
            .map(|value| value.parse())
            .collect::<Result<Vec<ParticipantRow>, _>>()?;

        tracing::info!(
            "Found {} participant(s) for {} {} code(s)",
            rows.len(),
            params.parameters.len(),
            params.code_type
        );
        Ok(rows)
    }

    /// Size of the cohort described by `request`.
    pub async fn count_cohort(&self, request: &SearchRequest) -> Result<i64, SearchError> {
        let query = CohortQueryCompiler::new(&self.registry).build_count(request)?;
        let count = self
            .executor
            .query_count(&query)
            .await
            .map_err(SearchError::Warehouse)?;
        tracing::info!(
            "{} participant(s) in cohort of {} include / {} exclude group(s)",
            count,
            request.includes.len(),
            request.excludes.len()
        );
        Ok(count)
    }

    /// Distinct persons in `domain` linked to any of `concept_ids`.
    pub async fn count_participants(
        &self,
        domain: &str,
        fact_table: Option<&str>,
        concept_ids: &[i64],
        scope: ConceptScope,
    ) -> Result<i64, SearchError> {
        let compiled = ParticipantCountCompiler::new(&self.registry).build_scoped(
            domain,
            fact_table,
            concept_ids,
            scope,
        )?;

        match compiled {
            ParticipantCountQuery::Empty => {
                tracing::debug!("No concept ids for {}, count is 0", domain);
                Ok(0)
            }
            ParticipantCountQuery::Query(query) => {
                let count = self
                    .executor
                    .query_count(&query)
                    .await
                    .map_err(SearchError::Warehouse)?;
                tracing::info!("{} participant(s) in {}", count, domain);
                Ok(count)
            }
        }
    }
}
