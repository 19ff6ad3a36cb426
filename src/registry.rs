//! Domain registry: where each clinical domain lives in the warehouse and
//! which vocabularies each code type searches.
//!
//! The registry is an immutable value handed to the compilers. It comes
//! either from the built-in OMOP table ([`DomainRegistry::default`]) or from
//! a TOML file:
//!
//! ```toml
//! [tables]
//! dataset = "my-project.cdr_2024q1"
//!
//! [domains.Condition]
//! fact_table = "condition_occurrence"
//! source_concept_column = "condition_source_concept_id"
//! standard_concept_column = "condition_concept_id"
//!
//! [[code_types.ICD9]]
//! param = "cm"
//! vocabulary_id = "ICD9CM"
//! ```
//!
//! Table and column names are inlined into SQL text, so they are validated
//! as identifiers when the registry is built.
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::CompileError;

/// Errors raised while loading a registry configuration.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid registry file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize registry: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("\"{0}\" is not a valid SQL identifier")]
    InvalidIdentifier(String),

    #[error("\"{0}\" is declared more than once (keys are case-insensitive)")]
    DuplicateKey(String),

    #[error("code type \"{0}\" has no vocabularies")]
    EmptyCodeType(String),

    #[error("code type \"{code_type}\" binds parameter \"{param}\" more than once")]
    DuplicateParam { code_type: String, param: String },
}

/// Fact table and concept columns for one clinical domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainMapping {
    pub fact_table: String,
    /// Column holding the as-recorded (source) concept of each event.
    pub source_concept_column: String,
    /// Column holding the standard concept each event was mapped to.
    pub standard_concept_column: String,
}

impl DomainMapping {
    fn new(fact_table: &str, source_concept_column: &str, standard_concept_column: &str) -> Self {
        Self {
            fact_table: fact_table.to_string(),
            source_concept_column: source_concept_column.to_string(),
            standard_concept_column: standard_concept_column.to_string(),
        }
    }
}

/// A vocabulary id together with the SQL parameter it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub param: String,
    pub vocabulary_id: String,
}

impl Vocabulary {
    fn new(param: &str, vocabulary_id: &str) -> Self {
        Self {
            param: param.to_string(),
            vocabulary_id: vocabulary_id.to_string(),
        }
    }
}

/// Names of the shared (non fact) warehouse tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseTables {
    /// Optional `project.dataset` qualifier applied to every table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    pub person: String,
    pub concept: String,
    pub concept_ancestor: String,
    pub concept_relationship: String,
}

impl Default for WarehouseTables {
    fn default() -> Self {
        Self {
            dataset: None,
            person: String::from("person"),
            concept: String::from("concept"),
            concept_ancestor: String::from("concept_ancestor"),
            concept_relationship: String::from("concept_relationship"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    tables: WarehouseTables,
    domains: IndexMap<String, DomainMapping>,
    code_types: IndexMap<String, Vec<Vocabulary>>,
}

/// Read-only lookup from domain ids and code types to warehouse metadata.
///
/// Keys match ASCII case-insensitively.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainRegistry {
    tables: WarehouseTables,
    domains: IndexMap<String, DomainMapping>,
    code_types: IndexMap<String, Vec<Vocabulary>>,
}

impl Default for DomainRegistry {
    fn default() -> Self {
        let domains = [
            ("Condition", "condition_occurrence", "condition"),
            ("Procedure", "procedure_occurrence", "procedure"),
            ("Measurement", "measurement", "measurement"),
            ("Drug", "drug_exposure", "drug"),
            ("Observation", "observation", "observation"),
            ("Device", "device_exposure", "device"),
            ("Visit", "visit_occurrence", "visit"),
        ]
        .into_iter()
        .map(|(domain, table, prefix)| {
            (
                domain.to_string(),
                DomainMapping::new(
                    table,
                    &format!("{prefix}_source_concept_id"),
                    &format!("{prefix}_concept_id"),
                ),
            )
        })
        .collect();

        let mut code_types = IndexMap::new();
        code_types.insert(
            "ICD9".to_string(),
            vec![Vocabulary::new("cm", "ICD9CM"), Vocabulary::new("proc", "ICD9Proc")],
        );
        code_types.insert(
            "ICD10".to_string(),
            vec![Vocabulary::new("cm", "ICD10CM"), Vocabulary::new("pcs", "ICD10PCS")],
        );
        code_types.insert("CPT".to_string(), vec![Vocabulary::new("cpt", "CPT4")]);

        Self {
            tables: WarehouseTables::default(),
            domains,
            code_types,
        }
    }
}

impl DomainRegistry {
    /// Build a registry from explicit parts, validating every name that will
    /// be inlined into SQL.
    pub fn new(
        tables: WarehouseTables,
        domains: IndexMap<String, DomainMapping>,
        code_types: IndexMap<String, Vec<Vocabulary>>,
    ) -> Result<Self, RegistryError> {
        if let Some(dataset) = &tables.dataset {
            if !is_dataset(dataset) {
                return Err(RegistryError::InvalidIdentifier(dataset.clone()));
            }
        }
        for name in [
            &tables.person,
            &tables.concept,
            &tables.concept_ancestor,
            &tables.concept_relationship,
        ] {
            check_identifier(name)?;
        }

        check_unique_keys(domains.keys())?;
        for (domain, mapping) in &domains {
            check_identifier(domain)?;
            check_identifier(&mapping.fact_table)?;
            check_identifier(&mapping.source_concept_column)?;
            check_identifier(&mapping.standard_concept_column)?;
        }

        check_unique_keys(code_types.keys())?;
        for (code_type, vocabularies) in &code_types {
            // Code types suffix vocabulary params in cohort queries (`cmICD9`).
            check_identifier(code_type)?;
            if vocabularies.is_empty() {
                return Err(RegistryError::EmptyCodeType(code_type.clone()));
            }
            let mut params: Vec<&str> = Vec::new();
            for vocabulary in vocabularies {
                check_identifier(&vocabulary.param)?;
                if params.contains(&vocabulary.param.as_str()) {
                    return Err(RegistryError::DuplicateParam {
                        code_type: code_type.clone(),
                        param: vocabulary.param.clone(),
                    });
                }
                params.push(&vocabulary.param);
            }
        }

        Ok(Self {
            tables,
            domains,
            code_types,
        })
    }

    pub fn from_toml_str(source: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = toml::from_str(source)?;
        Self::new(file.tables, file.domains, file.code_types)
    }

    pub fn to_toml_string(&self) -> Result<String, RegistryError> {
        let file = RegistryFile {
            tables: self.tables.clone(),
            domains: self.domains.clone(),
            code_types: self.code_types.clone(),
        };
        Ok(toml::to_string_pretty(&file)?)
    }

    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let data = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&data)
    }

    /// Load `<config dir>/cohortsql/registry.toml`, or the built-in table if
    /// that file does not exist.
    pub fn load_default() -> Result<Self, RegistryError> {
        match default_registry_path() {
            Some(path) if path.exists() => {
                tracing::debug!("Loading domain registry from {}", path.display());
                Self::load(&path)
            }
            Some(path) => {
                tracing::warn!(
                    "No registry file at {}, using built-in OMOP domains",
                    path.display()
                );
                Ok(Self::default())
            }
            None => {
                tracing::warn!("Could not determine config directory, using built-in OMOP domains");
                Ok(Self::default())
            }
        }
    }

    pub fn tables(&self) -> &WarehouseTables {
        &self.tables
    }

    pub fn resolve(&self, domain_id: &str) -> Result<&DomainMapping, CompileError> {
        self.domains
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(domain_id))
            .map(|(_, mapping)| mapping)
            .ok_or_else(|| CompileError::UnknownDomain(domain_id.to_string()))
    }

    pub fn vocabularies_for(&self, code_type: &str) -> Result<&[Vocabulary], CompileError> {
        self.code_types
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(code_type))
            .map(|(_, vocabularies)| vocabularies.as_slice())
            .ok_or_else(|| CompileError::UnknownCodeType(code_type.to_string()))
    }

    pub fn domain_ids(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }
}

pub fn default_registry_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("cohortsql").join("registry.toml"))
}

/// Plain SQL identifier: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `project.dataset` qualifier. Rendered inside backticks, so `-` and `.`
/// are allowed as well.
fn is_dataset(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

fn check_identifier(name: &str) -> Result<(), RegistryError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(RegistryError::InvalidIdentifier(name.to_string()))
    }
}

fn check_unique_keys<'a>(keys: impl Iterator<Item = &'a String>) -> Result<(), RegistryError> {
    let mut seen: Vec<String> = Vec::new();
    for key in keys {
        let folded = key.to_ascii_lowercase();
        if seen.contains(&folded) {
            return Err(RegistryError::DuplicateKey(key.clone()));
        }
        seen.push(folded);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_builtin_domains() {
        let registry = DomainRegistry::default();
        let condition = registry.resolve("Condition").unwrap();
        assert_eq!(condition.fact_table, "condition_occurrence");
        assert_eq!(condition.source_concept_column, "condition_source_concept_id");
        assert_eq!(condition.standard_concept_column, "condition_concept_id");

        let measurement = registry.resolve("Measurement").unwrap();
        assert_eq!(measurement.fact_table, "measurement");
        assert_eq!(
            measurement.source_concept_column,
            "measurement_source_concept_id"
        );

        let procedure = registry.resolve("Procedure").unwrap();
        assert_eq!(procedure.fact_table, "procedure_occurrence");
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let registry = DomainRegistry::default();
        assert_eq!(
            registry.resolve("condition").unwrap(),
            registry.resolve("CONDITION").unwrap()
        );
    }

    #[test]
    fn test_unknown_domain() {
        let registry = DomainRegistry::default();
        assert_eq!(
            registry.resolve("Vitals"),
            Err(CompileError::UnknownDomain("Vitals".to_string()))
        );
    }

    #[test]
    fn test_vocabularies_for_code_types() {
        let registry = DomainRegistry::default();
        let ids = |code_type: &str| -> Vec<String> {
            registry
                .vocabularies_for(code_type)
                .unwrap()
                .iter()
                .map(|v| v.vocabulary_id.clone())
                .collect()
        };
        assert_eq!(ids("ICD9"), vec!["ICD9CM", "ICD9Proc"]);
        assert_eq!(ids("ICD10"), vec!["ICD10CM", "ICD10PCS"]);
        assert_eq!(ids("cpt"), vec!["CPT4"]);
    }

    #[test]
    fn test_unknown_code_type() {
        let registry = DomainRegistry::default();
        assert_eq!(
            registry.vocabularies_for("SNOMED").unwrap_err(),
            CompileError::UnknownCodeType("SNOMED".to_string())
        );
    }

    #[test]
    fn test_from_toml_str() {
        let source = r#"
            [tables]
            dataset = "all-of-us.cdr_r5"

            [domains.Condition]
            fact_table = "cb_condition"
            source_concept_column = "src_id"
            standard_concept_column = "std_id"

            [[code_types.ICD9]]
            param = "cm"
            vocabulary_id = "ICD9CM"
        "#;
        let registry = DomainRegistry::from_toml_str(source).unwrap();
        assert_eq!(registry.tables().dataset.as_deref(), Some("all-of-us.cdr_r5"));
        assert_eq!(registry.tables().person, "person");
        assert_eq!(registry.resolve("condition").unwrap().fact_table, "cb_condition");
        assert!(registry.resolve("Procedure").is_err());
        assert_eq!(registry.vocabularies_for("ICD9").unwrap().len(), 1);
    }

    #[test]
    fn test_toml_round_trip_of_builtin_registry() {
        let registry = DomainRegistry::default();
        let text = registry.to_toml_string().unwrap();
        let reloaded = DomainRegistry::from_toml_str(&text).unwrap();
        assert_eq!(reloaded, registry);
    }

    #[test]
    fn test_rejects_unsafe_identifiers() {
        let source = r#"
            [domains.Condition]
            fact_table = "condition_occurrence; DROP TABLE person"
            source_concept_column = "condition_source_concept_id"
            standard_concept_column = "condition_concept_id"

            [code_types]
        "#;
        assert!(matches!(
            DomainRegistry::from_toml_str(source),
            Err(RegistryError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_rejects_case_insensitive_duplicates() {
        let mut domains = IndexMap::new();
        domains.insert(
            "Condition".to_string(),
            DomainMapping::new("a", "b", "c"),
        );
        domains.insert(
            "condition".to_string(),
            DomainMapping::new("a", "b", "c"),
        );
        let result = DomainRegistry::new(WarehouseTables::default(), domains, IndexMap::new());
        assert!(matches!(result, Err(RegistryError::DuplicateKey(key)) if key == "condition"));
    }

    #[test]
    fn test_rejects_empty_code_type() {
        let mut code_types = IndexMap::new();
        code_types.insert("ICD9".to_string(), Vec::new());
        let result = DomainRegistry::new(WarehouseTables::default(), IndexMap::new(), code_types);
        assert!(matches!(result, Err(RegistryError::EmptyCodeType(_))));
    }

    #[test]
    fn test_rejects_param_bound_twice_in_one_code_type() {
        let source = r#"
            [domains.Condition]
            fact_table = "condition_occurrence"
            source_concept_column = "condition_source_concept_id"
            standard_concept_column = "condition_concept_id"

            [[code_types.ICD9]]
            param = "cm"
            vocabulary_id = "ICD9CM"

            [[code_types.ICD9]]
            param = "cm"
            vocabulary_id = "ICD9Proc"
        "#;
        match DomainRegistry::from_toml_str(source) {
            Err(RegistryError::DuplicateParam { code_type, param }) => {
                assert_eq!(code_type, "ICD9");
                assert_eq!(param, "cm");
            }
            other => panic!("expected DuplicateParam, got {other:?}"),
        }
    }

    #[test]
    fn test_same_param_in_different_code_types_is_allowed() {
        let registry = DomainRegistry::default();
        assert_eq!(registry.vocabularies_for("ICD9").unwrap()[0].param, "cm");
        assert_eq!(registry.vocabularies_for("ICD10").unwrap()[0].param, "cm");
    }

    #[test]
    fn test_rejects_code_type_that_is_not_an_identifier() {
        let mut code_types = IndexMap::new();
        code_types.insert("ICD-9".to_string(), vec![Vocabulary::new("cm", "ICD9CM")]);
        let result = DomainRegistry::new(WarehouseTables::default(), IndexMap::new(), code_types);
        assert!(matches!(result, Err(RegistryError::InvalidIdentifier(name)) if name == "ICD-9"));
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("condition_occurrence"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
        assert!(is_dataset("my-project.cdr"));
        assert!(!is_dataset("proj`.x"));
        assert!(!is_dataset(".cdr"));
    }
}
