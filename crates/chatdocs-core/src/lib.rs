//! # chatdocs core
//!
//! I/O-free building blocks for chatdocs: collection and document models,
//! the index status state machine, the passage chunker, vector helpers,
//! the [`store::VectorBackend`] trait (with an in-memory implementation),
//! the index manifest, and markdown answer formatting.
//!
//! Nothing in this crate opens files, sockets or database connections;
//! the `chatdocs` crate supplies those.

pub mod answer;
pub mod chunk;
pub mod manifest;
pub mod models;
pub mod store;
pub mod vector;
