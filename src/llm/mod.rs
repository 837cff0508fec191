//! LLM provider abstraction used by the draft generator

pub mod provider;
pub mod providers;

pub use provider::*;
pub use providers::*;
