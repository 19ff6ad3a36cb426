//! Cohort query compiler.
//!
//! A [`SearchRequest`] becomes a single query over `person`:
//!
//! ```text
//! ... FROM person AS person
//! WHERE person.person_id IN (<include group 1>)
//!   AND person.person_id IN (<include group 2>)
//!   AND NOT EXISTS (SELECT 'x' FROM (<exclude group>) AS x
//!                   WHERE x.person_id = person.person_id)
//! ```
//!
//! A group is the `UNION ALL` of its items. Items are numbered across the
//! whole request, includes first, and the number suffixes every parameter
//! the item binds (`Conditioncodes1`, `gender2`), so the same domain may be
//! searched by several items. Vocabulary parameters are suffixed with their
//! code type instead (`cmICD9`) and shared by all items of that type.
use indexmap::IndexMap;
use std::collections::BTreeMap;

use super::codes::{bind_unique, CodesQueryCompiler, ParamSuffix};
use super::types::{
    CompiledQuery, QueryParameterValue, QueryParameters, SearchGroup, SearchGroupItem,
    SearchRequest,
};
use crate::ast::{compile, Expression, SelectItem, SelectQuery, SetQuantifier, TableRef};
use crate::error::CompileError;
use crate::registry::DomainRegistry;

const MAIN_ALIAS: &str = "person";
const PERSON_ALIAS: &str = "p";
const EXCLUDED_ALIAS: &str = "x";

/// Item type of demographic criteria.
pub const DEMOGRAPHIC_ITEM: &str = "DEMO";

/// (subtype, parameter stem, person column)
const DEMOGRAPHICS: [(&str, &str, &str); 3] = [
    ("GEN", "gender", "gender_concept_id"),
    ("RACE", "race", "race_concept_id"),
    ("ETH", "ethnicity", "ethnicity_concept_id"),
];

const PARTICIPANT_COLUMNS: [&str; 5] = [
    "person_id",
    "race_concept_id",
    "gender_concept_id",
    "ethnicity_concept_id",
    "birth_datetime",
];

pub struct CohortQueryCompiler<'a> {
    registry: &'a DomainRegistry,
}

impl<'a> CohortQueryCompiler<'a> {
    pub fn new(registry: &'a DomainRegistry) -> Self {
        Self { registry }
    }

    /// `SELECT COUNT(DISTINCT person.person_id) AS count ...`
    pub fn build_count(&self, request: &SearchRequest) -> Result<CompiledQuery, CompileError> {
        let mut named_parameters = BTreeMap::new();
        let mut select = self.cohort_select(request, &mut named_parameters)?;
        select.projections = vec![SelectItem::aliased(
            Expression::Function {
                name: "COUNT".to_string(),
                args: vec![main_person_id()],
                distinct: true,
            },
            "count",
        )];
        Ok(finish("count", select, named_parameters))
    }

    /// One page of the cohort with each person's demographic concepts,
    /// ordered by person id. An `offset` of 0 is left out of the SQL.
    pub fn build_participant_ids(
        &self,
        request: &SearchRequest,
        limit: u64,
        offset: u64,
    ) -> Result<CompiledQuery, CompileError> {
        let mut named_parameters = BTreeMap::new();
        let mut select = self.cohort_select(request, &mut named_parameters)?;
        select.distinct = true;
        select.projections = PARTICIPANT_COLUMNS
            .iter()
            .map(|column| SelectItem::expr(Expression::column(Some(MAIN_ALIAS), column)))
            .collect();
        select.order_by = vec![main_person_id()];
        select.limit = Some(limit);
        select.offset = (offset > 0).then_some(offset);
        Ok(finish("participant id", select, named_parameters))
    }

    /// `FROM person AS person WHERE <group conditions>`, without projections.
    fn cohort_select(
        &self,
        request: &SearchRequest,
        named_parameters: &mut BTreeMap<String, QueryParameterValue>,
    ) -> Result<SelectQuery, CompileError> {
        if request.includes.is_empty() && request.excludes.is_empty() {
            tracing::warn!("Rejecting search request without include or exclude groups");
            return Err(CompileError::EmptySearchRequest);
        }

        let mut ordinal = 0;
        let mut conditions = Vec::new();
        for group in &request.includes {
            let members = self.group_query(group, &mut ordinal, named_parameters)?;
            conditions.push(main_person_id().in_subquery(members));
        }
        for group in &request.excludes {
            let members = self.group_query(group, &mut ordinal, named_parameters)?;
            conditions.push(not_member_of(members));
        }

        let tables = self.registry.tables();
        Ok(SelectQuery {
            from: vec![TableRef::table(
                tables.dataset.as_deref(),
                &tables.person,
                Some(MAIN_ALIAS),
            )],
            filter: Expression::conjunction(conditions),
            ..Default::default()
        })
    }

    fn group_query(
        &self,
        group: &SearchGroup,
        ordinal: &mut usize,
        named_parameters: &mut BTreeMap<String, QueryParameterValue>,
    ) -> Result<SelectQuery, CompileError> {
        let mut items = Vec::with_capacity(group.items.len());
        for item in &group.items {
            *ordinal += 1;
            items.push(self.item_query(item, &ordinal.to_string(), named_parameters)?);
        }
        SelectQuery::union(items, SetQuantifier::All).ok_or(CompileError::EmptyCriteria)
    }

    /// A query projecting the `person_id` of every person the item matches.
    fn item_query(
        &self,
        item: &SearchGroupItem,
        ordinal: &str,
        named_parameters: &mut BTreeMap<String, QueryParameterValue>,
    ) -> Result<SelectQuery, CompileError> {
        let mut subqueries = if item.item_type.eq_ignore_ascii_case(DEMOGRAPHIC_ITEM) {
            self.demographic_subqueries(item, ordinal, named_parameters)?
        } else {
            let params = QueryParameters::from(item.clone());
            let suffix = ParamSuffix {
                vocabulary: &params.code_type,
                codes: ordinal,
            };
            CodesQueryCompiler::new(self.registry).domain_subqueries(
                &params,
                suffix,
                named_parameters,
            )?
        };

        if subqueries.len() == 1 {
            return Ok(subqueries.remove(0));
        }
        let union = SelectQuery::union(subqueries, SetQuantifier::Distinct)
            .ok_or(CompileError::EmptyCriteria)?;
        Ok(self.person_subquery(
            Expression::column(Some(PERSON_ALIAS), "person_id").in_subquery(union),
        ))
    }

    /// One sub-query per demographic subtype, in first-seen order.
    fn demographic_subqueries(
        &self,
        item: &SearchGroupItem,
        ordinal: &str,
        named_parameters: &mut BTreeMap<String, QueryParameterValue>,
    ) -> Result<Vec<SelectQuery>, CompileError> {
        let mut by_subtype: IndexMap<(&str, &str, &str), Vec<i64>> = IndexMap::new();
        for param in &item.search_parameters {
            let subtype = param.subtype.as_deref().unwrap_or_default();
            let known = DEMOGRAPHICS
                .iter()
                .find(|(key, _, _)| key.eq_ignore_ascii_case(subtype))
                .copied()
                .ok_or_else(|| CompileError::UnknownDemographic(subtype.to_string()))?;
            let concept_id = param
                .concept_id
                .ok_or_else(|| CompileError::MissingConceptId(subtype.to_string()))?;
            let ids = by_subtype.entry(known).or_default();
            if !ids.contains(&concept_id) {
                ids.push(concept_id);
            }
        }

        let mut subqueries = Vec::with_capacity(by_subtype.len());
        for ((subtype, stem, column), ids) in by_subtype {
            let name = format!("{stem}{ordinal}");
            bind_unique(
                named_parameters,
                &name,
                QueryParameterValue::Int64Array(ids),
                subtype,
            )?;
            let mut select = self.person_subquery(
                Expression::column(Some(PERSON_ALIAS), column)
                    .in_unnest(Expression::param(&name)),
            );
            select.distinct = true;
            subqueries.push(select);
        }
        Ok(subqueries)
    }

    /// `SELECT p.person_id FROM person AS p WHERE <filter>`
    fn person_subquery(&self, filter: Expression) -> SelectQuery {
        let tables = self.registry.tables();
        SelectQuery {
            projections: vec![SelectItem::expr(Expression::column(
                Some(PERSON_ALIAS),
                "person_id",
            ))],
            from: vec![TableRef::table(
                tables.dataset.as_deref(),
                &tables.person,
                Some(PERSON_ALIAS),
            )],
            filter: Some(filter),
            ..Default::default()
        }
    }
}

fn main_person_id() -> Expression {
    Expression::column(Some(MAIN_ALIAS), "person_id")
}

/// `NOT EXISTS (SELECT 'x' FROM (<members>) AS x WHERE x.person_id = person.person_id)`
fn not_member_of(members: SelectQuery) -> Expression {
    let correlated = SelectQuery {
        projections: vec![SelectItem::expr(Expression::string("x"))],
        from: vec![TableRef::Derived {
            subquery: Box::new(members.into()),
            alias: EXCLUDED_ALIAS.to_string(),
        }],
        filter: Some(Expression::column(Some(EXCLUDED_ALIAS), "person_id").eq(main_person_id())),
        ..Default::default()
    };
    Expression::Exists(Box::new(correlated.into())).not()
}

fn finish(
    kind: &str,
    select: SelectQuery,
    named_parameters: BTreeMap<String, QueryParameterValue>,
) -> CompiledQuery {
    let query_text = compile(&select.into());
    tracing::debug!(
        "Compiled cohort {} query with {} parameter(s): {}",
        kind,
        named_parameters.len(),
        query_text
    );
    CompiledQuery {
        query_text,
        named_parameters,
    }
}
