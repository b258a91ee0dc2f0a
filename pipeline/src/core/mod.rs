//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod normalize;
pub mod outcome;
pub mod path;
pub mod safety;
pub mod structure;
pub mod types;
