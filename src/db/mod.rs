mod executor;
mod search;

pub use executor::*;
pub use search::*;
