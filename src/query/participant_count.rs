/// Participant count compiler.
///
/// Counts the distinct persons whose events in one domain reference any of
/// a set of concept ids.
use std::collections::BTreeMap;

use super::types::{CompiledQuery, QueryParameterValue};
use crate::ast::{compile, Expression, SelectItem, SelectQuery, TableRef};
use crate::error::CompileError;
use crate::registry::{is_identifier, DomainRegistry};

const CONCEPT_IDS_PARAM: &str = "conceptIds";

/// Relationship linking a source concept to its standard equivalent.
const MAPS_TO: &str = "Maps to";

/// How the concept ids of a count request are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConceptScope {
    /// Match the ids against the source concept column as-is.
    #[default]
    Source,
    /// The ids are known standard concepts; match the standard column.
    Standard,
    /// The ids may be non-standard. Match them as source concepts, and also
    /// match every standard descendant of the concepts they map to.
    MapToStandard,
}

impl ConceptScope {
    /// `true` when the caller knows the ids are standard.
    pub fn from_standard_flag(standard_only: bool) -> Self {
        if standard_only {
            ConceptScope::Standard
        } else {
            ConceptScope::MapToStandard
        }
    }
}

/// Result of compiling a count request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantCountQuery {
    /// No concept ids: the count is zero and nothing needs to run.
    Empty,
    Query(CompiledQuery),
}

pub struct ParticipantCountCompiler<'a> {
    registry: &'a DomainRegistry,
}

impl<'a> ParticipantCountCompiler<'a> {
    pub fn new(registry: &'a DomainRegistry) -> Self {
        Self { registry }
    }

    /// Count over the source concept column.
    pub fn build(
        &self,
        domain: &str,
        fact_table: Option<&str>,
        concept_ids: &[i64],
    ) -> Result<ParticipantCountQuery, CompileError> {
        self.build_scoped(domain, fact_table, concept_ids, ConceptScope::Source)
    }

    /// `fact_table` overrides the registry's table for `domain`; the concept
    /// columns always come from the registry.
    pub fn build_scoped(
        &self,
        domain: &str,
        fact_table: Option<&str>,
        concept_ids: &[i64],
        scope: ConceptScope,
    ) -> Result<ParticipantCountQuery, CompileError> {
        let mapping = self.registry.resolve(domain)?;
        let fact_table = match fact_table {
            Some(table) if is_identifier(table) => table,
            Some(table) => return Err(CompileError::InvalidIdentifier(table.to_string())),
            None => mapping.fact_table.as_str(),
        };

        if concept_ids.is_empty() {
            return Ok(ParticipantCountQuery::Empty);
        }

        let mut ids: Vec<i64> = Vec::with_capacity(concept_ids.len());
        for id in concept_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }

        let source = || Expression::column(None, &mapping.source_concept_column);
        let standard = || Expression::column(None, &mapping.standard_concept_column);
        let concept_ids_param = || Expression::param(CONCEPT_IDS_PARAM);

        let filter = match scope {
            ConceptScope::Source => source().in_unnest(concept_ids_param()),
            ConceptScope::Standard => standard().in_unnest(concept_ids_param()),
            ConceptScope::MapToStandard => source()
                .in_unnest(concept_ids_param())
                .or(standard().in_subquery(self.standard_descendants())),
        };

        let tables = self.registry.tables();
        let select = SelectQuery {
            distinct: false,
            projections: vec![SelectItem::aliased(
                Expression::Function {
                    name: "COUNT".to_string(),
                    args: vec![Expression::column(None, "person_id")],
                    distinct: true,
                },
                "count",
            )],
            from: vec![TableRef::table(tables.dataset.as_deref(), fact_table, None)],
            filter: Some(filter),
            ..Default::default()
        };

        let query_text = compile(&select.into());
        tracing::debug!(
            "Compiled {:?} participant count for {} over {} concept(s): {}",
            scope,
            domain,
            ids.len(),
            query_text
        );

        let mut named_parameters = BTreeMap::new();
        named_parameters.insert(
            CONCEPT_IDS_PARAM.to_string(),
            QueryParameterValue::Int64Array(ids),
        );

        Ok(ParticipantCountQuery::Query(CompiledQuery {
            query_text,
            named_parameters,
        }))
    }

    /// Standard descendants of the concepts `@conceptIds` map to.
    fn standard_descendants(&self) -> SelectQuery {
        let tables = self.registry.tables();
        let dataset = tables.dataset.as_deref();
        let filter = Expression::conjunction(vec![
            Expression::column(Some("cr"), "concept_id_1")
                .in_unnest(Expression::param(CONCEPT_IDS_PARAM)),
            Expression::column(Some("cr"), "relationship_id").eq(Expression::string(MAPS_TO)),
            Expression::column(Some("ca"), "ancestor_concept_id")
                .eq(Expression::column(Some("cr"), "concept_id_2")),
        ]);

        SelectQuery {
            distinct: false,
            projections: vec![SelectItem::expr(Expression::column(
                Some("ca"),
                "descendant_concept_id",
            ))],
            from: vec![
                TableRef::table(dataset, &tables.concept_relationship, Some("cr")),
                TableRef::table(dataset, &tables.concept_ancestor, Some("ca")),
            ],
            filter,
            ..Default::default()
        }
    }
}
