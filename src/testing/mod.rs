//! Testing utilities and mock implementations
//!
//! Lets the publisher, consumer and worker run without a broker, database or LLM.

pub mod mocks;

pub use mocks::*;
