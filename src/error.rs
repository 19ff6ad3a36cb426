use thiserror::Error;

/// Invalid search criteria, detected while compiling and before any query
/// reaches the warehouse.
///
/// Every variant describes bad client input. Callers should surface these
/// as "bad request" responses and never retry them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("Bad Request: unknown domain \"{0}\"")]
    UnknownDomain(String),

    #[error("Bad Request: unknown code type \"{0}\"")]
    UnknownCodeType(String),

    #[error("Bad Request: parameter name \"{name}\" is produced more than once (by \"{source_key}\")")]
    DuplicateParameter { name: String, source_key: String },

    #[error("Bad Request: malformed code \"{code}\" in domain \"{domain}\"")]
    MalformedCode { domain: String, code: String },

    #[error("Bad Request: \"{0}\" is not a valid table or column name")]
    InvalidIdentifier(String),

    #[error("Bad Request: search criteria contain no codes")]
    EmptyCriteria,

    #[error("Bad Request: Invalid SearchRequest: includes[] and excludes[] cannot both be empty")]
    EmptySearchRequest,

    #[error("Bad Request: unsupported demographic subtype \"{0}\"")]
    UnknownDemographic(String),

    #[error("Bad Request: demographic parameter \"{0}\" has no concept id")]
    MissingConceptId(String),
}

impl CompileError {
    /// Compile errors always originate from the caller's criteria.
    pub fn is_client_error(&self) -> bool {
        true
    }
}
