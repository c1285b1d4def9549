pub mod error;
pub mod knowledge;

pub use error::{Error, Result};
pub use knowledge::KnowledgeBase;
