/// Codes query compiler.
///
/// Turns a list of (domain, code) pairs searched in one code system into a
/// single query returning one `val` row per matching person:
///
/// ```text
/// SELECT DISTINCT CONCAT(person_id, ',', gender, ',', race) AS val
/// FROM person WHERE person_id IN (
///     <domain 1 sub-query> UNION DISTINCT <domain 2 sub-query> ...)
/// ```
///
/// Domains are queried in the order they first appear in the input, which
/// keeps the SQL text stable for equal criteria.
use indexmap::IndexMap;
use std::collections::BTreeMap;

use super::types::{CompiledQuery, QueryParameterValue, QueryParameters, SearchParameter};
use crate::ast::{
    compile, Expression, Literal, SelectItem, SelectQuery, SetQuantifier, TableRef,
};
use crate::error::CompileError;
use crate::registry::{DomainMapping, DomainRegistry, Vocabulary};

const FACT_ALIAS: &str = "a";
const CONCEPT_ALIAS: &str = "b";
const PERSON_ALIAS: &str = "p";

pub struct CodesQueryCompiler<'a> {
    registry: &'a DomainRegistry,
}

impl<'a> CodesQueryCompiler<'a> {
    pub fn new(registry: &'a DomainRegistry) -> Self {
        Self { registry }
    }

    /// Group codes by domain id.
    ///
    /// Domains keep the order of their first appearance, and so do the
    /// distinct codes inside each domain. Blank codes are dropped, but their
    /// domain is still listed.
    pub fn mapped_parameters(parameters: &[SearchParameter]) -> IndexMap<String, Vec<String>> {
        let mut grouped: IndexMap<String, Vec<String>> = IndexMap::new();
        for param in parameters {
            let codes = grouped.entry(param.domain_id.clone()).or_default();
            let code = param.code.trim();
            if !code.is_empty() && !codes.iter().any(|c| c == code) {
                codes.push(code.to_string());
            }
        }
        grouped
    }

    pub fn build(&self, params: &QueryParameters) -> Result<CompiledQuery, CompileError> {
        let mut named_parameters = BTreeMap::new();
        let subqueries =
            self.domain_subqueries(params, ParamSuffix::default(), &mut named_parameters)?;
        let domain_count = subqueries.len();

        let union = SelectQuery::union(subqueries, SetQuantifier::Distinct)
            .ok_or(CompileError::EmptyCriteria)?;
        let query_text = compile(&self.person_query(union).into());

        tracing::debug!(
            "Compiled {} codes query over {} domain(s): {}",
            params.code_type,
            domain_count,
            query_text
        );

        Ok(CompiledQuery {
            query_text,
            named_parameters,
        })
    }

    /// One `SELECT DISTINCT a.person_id ...` per domain that has codes, in
    /// first-seen domain order. Binds the vocabulary and code parameters
    /// into `named_parameters`.
    pub(crate) fn domain_subqueries(
        &self,
        params: &QueryParameters,
        suffix: ParamSuffix<'_>,
        named_parameters: &mut BTreeMap<String, QueryParameterValue>,
    ) -> Result<Vec<SelectQuery>, CompileError> {
        let vocabularies = self.registry.vocabularies_for(&params.code_type)?;
        let grouped = Self::mapped_parameters(&params.parameters);

        // Resolve every domain up front so an unknown one fails the whole build.
        let domains = grouped
            .iter()
            .map(|(domain, codes)| {
                self.registry
                    .resolve(domain)
                    .map(|mapping| (domain, mapping, codes))
            })
            .collect::<Result<Vec<_>, CompileError>>()?;

        let vocabulary_params =
            bind_vocabularies(named_parameters, &params.code_type, vocabularies, suffix)?;

        let mut subqueries = Vec::new();
        for (domain, mapping, codes) in domains {
            let codes = CodeSet::classify(domain, codes)?;
            if codes.is_empty() {
                tracing::debug!("Dropping domain {} with no codes", domain);
                continue;
            }
            let code_filter = codes.bind(named_parameters, domain, suffix.codes)?;
            subqueries.push(self.domain_subquery(mapping, &vocabulary_params, code_filter));
        }
        Ok(subqueries)
    }

    /// `SELECT DISTINCT a.person_id FROM <fact> a, concept b WHERE ...`
    fn domain_subquery(
        &self,
        mapping: &DomainMapping,
        vocabulary_params: &[Expression],
        code_filter: Expression,
    ) -> SelectQuery {
        let tables = self.registry.tables();
        let dataset = tables.dataset.as_deref();

        let filter = Expression::conjunction(vec![
            Expression::column(Some(FACT_ALIAS), &mapping.source_concept_column)
                .eq(Expression::column(Some(CONCEPT_ALIAS), "concept_id")),
            Expression::InList {
                expr: Box::new(Expression::column(Some(CONCEPT_ALIAS), "vocabulary_id")),
                list: vocabulary_params.to_vec(),
                negated: false,
            },
            code_filter,
        ]);

        SelectQuery {
            distinct: true,
            projections: vec![SelectItem::expr(Expression::column(
                Some(FACT_ALIAS),
                "person_id",
            ))],
            from: vec![
                TableRef::table(dataset, &mapping.fact_table, Some(FACT_ALIAS)),
                TableRef::table(dataset, &tables.concept, Some(CONCEPT_ALIAS)),
            ],
            filter,
            ..Default::default()
        }
    }

    /// Wrap the per-domain union into the demographic projection.
    fn person_query(&self, union: SelectQuery) -> SelectQuery {
        let tables = self.registry.tables();
        let separator = || Expression::string(",");
        let val = Expression::Function {
            name: "CONCAT".to_string(),
            args: vec![
                Expression::Cast {
                    expr: Box::new(Expression::column(Some(PERSON_ALIAS), "person_id")),
                    data_type: "STRING".to_string(),
                },
                separator(),
                Expression::column(Some(PERSON_ALIAS), "gender_source_value"),
                separator(),
                Expression::column(Some(PERSON_ALIAS), "race_source_value"),
            ],
            distinct: false,
        };

        SelectQuery {
            distinct: true,
            projections: vec![SelectItem::aliased(val, "val")],
            from: vec![TableRef::table(
                tables.dataset.as_deref(),
                &tables.person,
                Some(PERSON_ALIAS),
            )],
            filter: Some(Expression::column(Some(PERSON_ALIAS), "person_id").in_subquery(union)),
            ..Default::default()
        }
    }
}

/// Appended to generated parameter names when several criteria share one
/// query: `vocabulary` after each vocabulary param (`cm` → `cmICD9`), `codes`
/// after each `{Domain}codes` / `{Domain}prefixes` param.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ParamSuffix<'s> {
    pub vocabulary: &'s str,
    pub codes: &'s str,
}

/// Bind one scalar per distinct vocabulary id and return the placeholders
/// shared by every domain sub-query. A name already bound to the same
/// vocabulary id is reused.
fn bind_vocabularies(
    named_parameters: &mut BTreeMap<String, QueryParameterValue>,
    code_type: &str,
    vocabularies: &[Vocabulary],
    suffix: ParamSuffix<'_>,
) -> Result<Vec<Expression>, CompileError> {
    let mut placeholders = Vec::new();
    let mut bound_ids: Vec<&str> = Vec::new();
    for vocabulary in vocabularies {
        if bound_ids.contains(&vocabulary.vocabulary_id.as_str()) {
            continue;
        }
        let name = format!("{}{}", vocabulary.param, suffix.vocabulary);
        let value = QueryParameterValue::String(vocabulary.vocabulary_id.clone());
        if named_parameters.get(&name) != Some(&value) {
            bind_unique(named_parameters, &name, value, code_type)?;
        }
        bound_ids.push(&vocabulary.vocabulary_id);
        placeholders.push(Expression::param(&name));
    }
    Ok(placeholders)
}

pub(crate) fn bind_unique(
    named_parameters: &mut BTreeMap<String, QueryParameterValue>,
    name: &str,
    value: QueryParameterValue,
    source_key: &str,
) -> Result<(), CompileError> {
    if named_parameters.contains_key(name) {
        return Err(CompileError::DuplicateParameter {
            name: name.to_string(),
            source_key: source_key.to_string(),
        });
    }
    named_parameters.insert(name.to_string(), value);
    Ok(())
}

/// `condition` → `Condition`. Only the first letter changes.
fn parameter_prefix(domain: &str) -> String {
    let mut chars = domain.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Codes of one domain, split into exact codes and `prefix*` patterns.
#[derive(Debug, Default)]
struct CodeSet {
    exact: Vec<String>,
    prefixes: Vec<String>,
}

impl CodeSet {
    fn classify(domain: &str, codes: &[String]) -> Result<Self, CompileError> {
        let mut set = CodeSet::default();
        for code in codes {
            let malformed = || CompileError::MalformedCode {
                domain: domain.to_string(),
                code: code.clone(),
            };
            match code.strip_suffix('*') {
                Some(prefix) if is_code(prefix) => set.prefixes.push(prefix.to_string()),
                Some(_) => return Err(malformed()),
                None if is_code(code) => set.exact.push(code.clone()),
                None => return Err(malformed()),
            }
        }
        Ok(set)
    }

    fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }

    /// Bind `{Domain}codes` / `{Domain}prefixes` and return the matching
    /// predicate on `b.concept_code`.
    fn bind(
        self,
        named_parameters: &mut BTreeMap<String, QueryParameterValue>,
        domain: &str,
        suffix: &str,
    ) -> Result<Expression, CompileError> {
        let prefix = parameter_prefix(domain);
        let concept_code = || Expression::column(Some(CONCEPT_ALIAS), "concept_code");
        let mut predicates = Vec::new();

        if !self.exact.is_empty() {
            let name = format!("{prefix}codes{suffix}");
            bind_unique(
                named_parameters,
                &name,
                QueryParameterValue::StringArray(self.exact),
                domain,
            )?;
            predicates.push(concept_code().in_unnest(Expression::param(&name)));
        }

        if !self.prefixes.is_empty() {
            let name = format!("{prefix}prefixes{suffix}");
            bind_unique(
                named_parameters,
                &name,
                QueryParameterValue::StringArray(self.prefixes),
                domain,
            )?;
            let starts_with = SelectQuery {
                projections: vec![SelectItem::expr(Expression::Literal(Literal::Integer(1)))],
                from: vec![TableRef::Unnest {
                    array: Expression::param(&name),
                    alias: "prefix".to_string(),
                }],
                filter: Some(Expression::Function {
                    name: "STARTS_WITH".to_string(),
                    args: vec![concept_code(), Expression::column(None, "prefix")],
                    distinct: false,
                }),
                ..Default::default()
            };
            predicates.push(Expression::Exists(Box::new(starts_with.into())));
        }

        Ok(match predicates.len() {
            1 => predicates.remove(0),
            _ => predicates
                .into_iter()
                .reduce(Expression::or)
                .map(Expression::nested)
                .unwrap_or_else(concept_code),
        })
    }
}

/// ASCII letters, digits, `.`, `-` and `_`.
fn is_code(code: &str) -> bool {
    !code.is_empty()
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn icd9(params: &[(&str, &str)]) -> QueryParameters {
        QueryParameters::new(
            "ICD9",
            params
                .iter()
                .map(|(domain, code)| SearchParameter::new(*domain, *code))
                .collect(),
        )
    }

    fn strings(values: &[&str]) -> QueryParameterValue {
        QueryParameterValue::StringArray(values.iter().map(|v| v.to_string()).collect())
    }

    #[test]
    fn test_mapped_parameters_groups_by_domain_in_first_seen_order() {
        let params = vec![
            SearchParameter::new("Measurement", "30.3"),
            SearchParameter::new("Condition", "10.1"),
            SearchParameter::new("Measurement", "40.4"),
            SearchParameter::new("Condition", "20.2"),
            SearchParameter::new("Condition", "10.1"),
        ];
        let mapped = CodesQueryCompiler::mapped_parameters(&params);
        let domains: Vec<&String> = mapped.keys().collect();
        assert_eq!(domains, vec!["Measurement", "Condition"]);
        assert_eq!(mapped["Measurement"], vec!["30.3", "40.4"]);
        assert_eq!(mapped["Condition"], vec!["10.1", "20.2"]);
    }

    #[test]
    fn test_mapped_parameters_keeps_domains_without_codes() {
        let params = vec![
            SearchParameter::new("Condition", "10.1"),
            SearchParameter::new("Procedure", "  "),
        ];
        let mapped = CodesQueryCompiler::mapped_parameters(&params);
        assert_eq!(mapped.len(), 2);
        assert!(mapped["Procedure"].is_empty());
    }

    #[test]
    fn test_build_unions_domains_in_insertion_order() {
        let registry = DomainRegistry::default();
        let compiler = CodesQueryCompiler::new(&registry);
        let query = compiler
            .build(&icd9(&[
                ("Condition", "10.1"),
                ("Condition", "20.2"),
                ("Measurement", "30.3"),
            ]))
            .unwrap();

        let condition = query.query_text.find("FROM condition_occurrence").unwrap();
        let measurement = query.query_text.find("FROM measurement AS a").unwrap();
        assert!(condition < measurement);
        assert!(query.query_text.contains("UNION DISTINCT"));

        assert_eq!(
            query.parameter("Conditioncodes"),
            Some(&strings(&["10.1", "20.2"]))
        );
        assert_eq!(query.parameter("Measurementcodes"), Some(&strings(&["30.3"])));
        assert_eq!(query.parameter("cm").and_then(|v| v.as_str()), Some("ICD9CM"));
        assert_eq!(
            query.parameter("proc").and_then(|v| v.as_str()),
            Some("ICD9Proc")
        );
        assert_eq!(query.named_parameters.len(), 4);
    }

    #[test]
    fn test_build_single_domain_sql_text() {
        let registry = DomainRegistry::default();
        let query = CodesQueryCompiler::new(&registry)
            .build(&icd9(&[("Condition", "10.1")]))
            .unwrap();
        assert_eq!(
            query.query_text,
            "SELECT DISTINCT CONCAT(CAST(p.person_id AS STRING), ',', p.gender_source_value, \
             ',', p.race_source_value) AS val FROM person AS p WHERE p.person_id IN \
             (SELECT DISTINCT a.person_id FROM condition_occurrence AS a, concept AS b \
             WHERE a.condition_source_concept_id = b.concept_id \
             AND b.vocabulary_id IN (@cm, @proc) \
             AND b.concept_code IN UNNEST(@Conditioncodes))"
        );
    }

    #[test]
    fn test_vocabulary_parameters_are_shared_across_domains() {
        let registry = DomainRegistry::default();
        let query = CodesQueryCompiler::new(&registry)
            .build(&icd9(&[("Condition", "10.1"), ("Procedure", "20.2")]))
            .unwrap();
        assert_eq!(query.query_text.matches("IN (@cm, @proc)").count(), 2);
        assert_eq!(
            query
                .named_parameters
                .keys()
                .filter(|k| k.as_str() == "cm" || k.as_str() == "proc")
                .count(),
            2
        );
    }

    #[test]
    fn test_build_is_deterministic_for_equal_input() {
        let registry = DomainRegistry::default();
        let compiler = CodesQueryCompiler::new(&registry);
        let input = [("Condition", "10.1"), ("Measurement", "30.3"), ("Condition", "20.2")];
        let first = compiler.build(&icd9(&input)).unwrap();
        let second = compiler.build(&icd9(&input)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_duplicate_codes_do_not_change_sql() {
        let registry = DomainRegistry::default();
        let compiler = CodesQueryCompiler::new(&registry);
        let plain = compiler.build(&icd9(&[("Condition", "10.1")])).unwrap();
        let noisy = compiler
            .build(&icd9(&[("Condition", "10.1"), ("Condition", " 10.1 ")]))
            .unwrap();
        assert_eq!(plain, noisy);
    }

    #[test]
    fn test_unknown_domain_fails() {
        let registry = DomainRegistry::default();
        let result = CodesQueryCompiler::new(&registry)
            .build(&icd9(&[("Condition", "10.1"), ("Vitals", "1")]));
        assert_eq!(result, Err(CompileError::UnknownDomain("Vitals".to_string())));
    }

    #[test]
    fn test_unknown_domain_without_codes_still_fails() {
        let registry = DomainRegistry::default();
        let result = CodesQueryCompiler::new(&registry)
            .build(&icd9(&[("Condition", "10.1"), ("Vitals", "")]));
        assert!(matches!(result, Err(CompileError::UnknownDomain(_))));
    }

    #[test]
    fn test_unknown_code_type_fails() {
        let registry = DomainRegistry::default();
        let params = QueryParameters::new("LOINC", vec![SearchParameter::new("Condition", "1")]);
        assert_eq!(
            CodesQueryCompiler::new(&registry).build(&params),
            Err(CompileError::UnknownCodeType("LOINC".to_string()))
        );
    }

    #[test]
    fn test_domain_without_codes_is_dropped() {
        let registry = DomainRegistry::default();
        let query = CodesQueryCompiler::new(&registry)
            .build(&icd9(&[("Condition", "10.1"), ("Procedure", "")]))
            .unwrap();
        assert!(!query.query_text.contains("procedure_occurrence"));
        assert!(!query.query_text.contains("UNION"));
        assert!(query.parameter("Procedurecodes").is_none());
    }

    #[test]
    fn test_no_codes_at_all_is_an_error() {
        let registry = DomainRegistry::default();
        let compiler = CodesQueryCompiler::new(&registry);
        assert_eq!(
            compiler.build(&icd9(&[("Condition", " ")])),
            Err(CompileError::EmptyCriteria)
        );
        assert_eq!(compiler.build(&icd9(&[])), Err(CompileError::EmptyCriteria));
    }

    #[test]
    fn test_colliding_parameter_names_fail() {
        let registry = DomainRegistry::default();
        let result = CodesQueryCompiler::new(&registry)
            .build(&icd9(&[("Condition", "10.1"), ("condition", "20.2")]));
        assert_eq!(
            result,
            Err(CompileError::DuplicateParameter {
                name: "Conditioncodes".to_string(),
                source_key: "condition".to_string(),
            })
        );
    }

    #[test]
    fn test_malformed_codes_fail() {
        let registry = DomainRegistry::default();
        let compiler = CodesQueryCompiler::new(&registry);
        for code in ["10.1'; --", "1*0", "*", "10 1"] {
            let result = compiler.build(&icd9(&[("Condition", code)]));
            assert!(
                matches!(result, Err(CompileError::MalformedCode { .. })),
                "{code} should be rejected"
            );
        }
    }

    #[test]
    fn test_wildcard_codes_use_prefix_parameter() {
        let registry = DomainRegistry::default();
        let query = CodesQueryCompiler::new(&registry)
            .build(&icd9(&[("Condition", "250.*"), ("Condition", "10.1")]))
            .unwrap();
        assert_eq!(query.parameter("Conditioncodes"), Some(&strings(&["10.1"])));
        assert_eq!(query.parameter("Conditionprefixes"), Some(&strings(&["250."])));
        assert!(query.query_text.contains(
            "(b.concept_code IN UNNEST(@Conditioncodes) OR EXISTS (SELECT 1 FROM \
             UNNEST(@Conditionprefixes) AS prefix WHERE STARTS_WITH(b.concept_code, prefix)))"
        ));
    }

    #[test]
    fn test_wildcard_only_domain() {
        let registry = DomainRegistry::default();
        let query = CodesQueryCompiler::new(&registry)
            .build(&icd9(&[("Condition", "001*")]))
            .unwrap();
        assert!(query.parameter("Conditioncodes").is_none());
        assert!(query.query_text.contains("AND EXISTS (SELECT 1 FROM UNNEST(@Conditionprefixes)"));
    }

    #[test]
    fn test_dataset_qualifies_every_table() {
        let registry = DomainRegistry::from_toml_str(
            r#"
            [tables]
            dataset = "proj.cdr"

            [domains.Condition]
            fact_table = "condition_occurrence"
            source_concept_column = "condition_source_concept_id"
            standard_concept_column = "condition_concept_id"

            [[code_types.CPT]]
            param = "cpt"
            vocabulary_id = "CPT4"
            "#,
        )
        .unwrap();
        let params = QueryParameters::new("CPT", vec![SearchParameter::new("Condition", "99213")]);
        let query = CodesQueryCompiler::new(&registry).build(&params).unwrap();
        assert!(query.query_text.contains("FROM `proj.cdr.person` AS p"));
        assert!(query.query_text.contains("FROM `proj.cdr.condition_occurrence` AS a, `proj.cdr.concept` AS b"));
        assert!(query.query_text.contains("b.vocabulary_id IN (@cpt)"));
    }

    #[test]
    fn test_vocabularies_are_deduplicated_by_value() {
        let mut code_types = IndexMap::new();
        code_types.insert(
            "ICD9".to_string(),
            vec![
                Vocabulary {
                    param: "cm".to_string(),
                    vocabulary_id: "ICD9CM".to_string(),
                },
                Vocabulary {
                    param: "cm2".to_string(),
                    vocabulary_id: "ICD9CM".to_string(),
                },
            ],
        );
        let defaults = DomainRegistry::default();
        let mut domains = IndexMap::new();
        domains.insert(
            "Condition".to_string(),
            defaults.resolve("Condition").unwrap().clone(),
        );
        let registry =
            DomainRegistry::new(defaults.tables().clone(), domains, code_types).unwrap();

        let query = CodesQueryCompiler::new(&registry)
            .build(&icd9(&[("Condition", "10.1")]))
            .unwrap();
        assert!(query.query_text.contains("IN (@cm)"));
        assert!(query.parameter("cm2").is_none());
    }

    #[test]
    fn test_parameter_prefix() {
        assert_eq!(parameter_prefix("condition"), "Condition");
        assert_eq!(parameter_prefix("Measurement"), "Measurement");
        assert_eq!(parameter_prefix(""), "");
    }
}
