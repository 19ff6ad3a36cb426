pub mod ast;
pub mod db;
pub mod error;
pub mod keyword;
pub mod query;
pub mod registry;

pub use error::CompileError;
pub use registry::DomainRegistry;
