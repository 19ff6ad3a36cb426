/// Clinical-criteria query compilers.
///
/// The compilers borrow a [`crate::registry::DomainRegistry`], hold no other
/// state, and turn their input into a [`CompiledQuery`] in a single pass.
pub mod codes;
pub mod cohort;
pub mod participant_count;
pub mod types;

pub use codes::CodesQueryCompiler;
pub use cohort::{CohortQueryCompiler, DEMOGRAPHIC_ITEM};
pub use participant_count::{ConceptScope, ParticipantCountCompiler, ParticipantCountQuery};
pub use types::*;
