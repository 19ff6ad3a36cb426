/// SQL AST shared by the query compilers.
///
/// ```text
/// Criteria (query/)
///       ↓
/// SQL AST                 (types.rs)
///       ↓
/// SQL renderer            (compiler.rs)
///       ↓
/// Query executor          (db/ module)
/// ```
pub mod compiler;
pub mod types;

pub use compiler::compile;
pub use types::*;
