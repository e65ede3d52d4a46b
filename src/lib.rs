//! # chatdocs
//!
//! Turns uploaded document collections into vector indexes and answers
//! natural-language questions over them.
//!
//! A client uploads files (or one ZIP archive) and picks a vector backend.
//! The files are stored as documents of a new collection and a background
//! job extracts, chunks, embeds and writes them to the backend, then
//! records a small index manifest. Query sessions load that manifest over
//! a WebSocket and answer either with one retrieval + completion (simple
//! mode) or with a tree summarization over a wider retrieval (enhanced
//! mode).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌────────────┐   ┌──────────────────┐
//! │  Upload  │──▶│ Ingest   │──▶│ Job runner │──▶│ Vector backend   │
//! │ HTTP/CLI │   │ + SQLite │   │ build/merge│   │ embedded/chroma/ │
//! └──────────┘   └──────────┘   └─────┬──────┘   │ milvus           │
//!                                     │          └────────┬─────────┘
//!                               manifest                  │
//!                                     ▼                   ▼
//!                               ┌──────────┐       ┌──────────────┐
//!                               │  Cache   │──────▶│ Query session│
//!                               └──────────┘       │  (WebSocket) │
//!                                                  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration |
//! | [`db`] / [`migrate`] | SQLite pool and schema |
//! | [`repository`] | Collections, documents, artifacts, status transitions |
//! | [`ingest`] | Upload normalization and collection creation |
//! | [`extract`] | Text extraction (plain text, PDF, DOCX, PPTX) |
//! | [`inference`] | Embedding and completion engines |
//! | [`backend`] | Vector backend selection and adapters |
//! | [`builder`] | Index build and refresh jobs |
//! | [`jobs`] | Background job runner |
//! | [`cache`] | Local manifest cache and index loading |
//! | [`index`] | Retrieval and answer synthesis |
//! | [`session`] | WebSocket query session protocol |
//! | [`server`] | HTTP and WebSocket surface |

pub mod app;
pub mod backend;
pub mod builder;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod index;
pub mod inference;
pub mod ingest;
pub mod jobs;
pub mod migrate;
pub mod repository;
pub mod server;
pub mod session;

pub use error::{Error, Result};
