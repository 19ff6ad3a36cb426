use std::fmt;
use std::future::Future;
use std::str::FromStr;
use thiserror::Error;

use crate::query::CompiledQuery;

/// Opaque failure reported by the warehouse client (network, quota, SQL).
pub type ExecutorError = Box<dyn std::error::Error + Send + Sync>;

/// Runs compiled queries against the warehouse.
///
/// Implementations own connections, retries and timeouts; this crate only
/// hands them ready-to-run statements and consumes fully materialized
/// results.
pub trait QueryExecutor: Send + Sync {
    /// Run a query whose rows have a single string column, one value per row.
    fn query_values(
        &self,
        query: &CompiledQuery,
    ) -> impl Future<Output = Result<Vec<String>, ExecutorError>> + Send;

    /// Run a query returning a single integer.
    fn query_count(
        &self,
        query: &CompiledQuery,
    ) -> impl Future<Output = Result<i64, ExecutorError>> + Send;
}

/// One `val` row of a codes query: `person_id,gender_source_value,race_source_value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRow {
    pub person_id: i64,
    pub gender_source_value: String,
    pub race_source_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed participant row \"{0}\"")]
pub struct RowParseError(pub String);

impl FromStr for ParticipantRow {
    type Err = RowParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let malformed = || RowParseError(value.to_string());
        let mut fields = value.splitn(3, ',');
        let person_id = fields
            .next()
            .and_then(|id| id.trim().parse().ok())
            .ok_or_else(malformed)?;
        let gender_source_value = fields.next().ok_or_else(malformed)?.to_string();
        let race_source_value = fields.next().ok_or_else(malformed)?.to_string();
        Ok(Self {
            person_id,
            gender_source_value,
            race_source_value,
        })
    }
}

impl fmt::Display for ParticipantRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{}",
            self.person_id, self.gender_source_value, self.race_source_value
        )
    }
}
