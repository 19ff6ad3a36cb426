//! Compiler inputs and outputs.
//!
//! All of these are per-request values: built by the caller, read by a
//! compiler, then dropped.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One atomic matcher: a code within a clinical domain, or for `DEMO`
/// items a demographic concept (`subtype` + `concept_id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParameter {
    #[serde(default)]
    pub domain_id: String,
    /// A dotted clinical code (`250.01`) or a prefix pattern (`250.*`).
    #[serde(default)]
    pub code: String,
    /// `GEN`, `RACE` or `ETH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept_id: Option<i64>,
}

impl SearchParameter {
    pub fn new(domain_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            domain_id: domain_id.into(),
            code: code.into(),
            subtype: None,
            concept_id: None,
        }
    }

    pub fn demographic(subtype: impl Into<String>, concept_id: i64) -> Self {
        Self {
            domain_id: String::new(),
            code: String::new(),
            subtype: Some(subtype.into()),
            concept_id: Some(concept_id),
        }
    }
}

/// A code system together with the parameters searched in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchGroupItem {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub search_parameters: Vec<SearchParameter>,
}

impl SearchGroupItem {
    pub fn new(item_type: impl Into<String>, search_parameters: Vec<SearchParameter>) -> Self {
        Self {
            item_type: item_type.into(),
            search_parameters,
        }
    }
}

/// Items OR-ed together: a person matches the group when any item matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchGroup {
    #[serde(default)]
    pub items: Vec<SearchGroupItem>,
}

impl SearchGroup {
    pub fn new(items: Vec<SearchGroupItem>) -> Self {
        Self { items }
    }
}

/// A cohort definition: persons matching every include group and none of
/// the exclude groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub includes: Vec<SearchGroup>,
    #[serde(default)]
    pub excludes: Vec<SearchGroup>,
}

/// Input of the codes query compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParameters {
    /// Code system (`ICD9`, `ICD10`, `CPT`) shared by every parameter.
    #[serde(rename = "type")]
    pub code_type: String,
    #[serde(default)]
    pub parameters: Vec<SearchParameter>,
}

impl QueryParameters {
    pub fn new(code_type: impl Into<String>, parameters: Vec<SearchParameter>) -> Self {
        Self {
            code_type: code_type.into(),
            parameters,
        }
    }
}

impl From<SearchGroupItem> for QueryParameters {
    fn from(item: SearchGroupItem) -> Self {
        Self {
            code_type: item.item_type,
            parameters: item.search_parameters,
        }
    }
}

/// A typed value bound to a named query parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryParameterValue {
    String(String),
    Int64(i64),
    StringArray(Vec<String>),
    Int64Array(Vec<i64>),
}

impl QueryParameterValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            QueryParameterValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_string_array(&self) -> Option<&[String]> {
        match self {
            QueryParameterValue::StringArray(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_int64_array(&self) -> Option<&[i64]> {
        match self {
            QueryParameterValue::Int64Array(values) => Some(values),
            _ => None,
        }
    }
}

/// SQL text plus the values of every `@name` it references.
///
/// The text is a pure function of the criteria it was compiled from, so it
/// can be used directly as a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledQuery {
    pub query_text: String,
    pub named_parameters: BTreeMap<String, QueryParameterValue>,
}

impl CompiledQuery {
    pub fn parameter(&self, name: &str) -> Option<&QueryParameterValue> {
        self.named_parameters.get(name)
    }
}
