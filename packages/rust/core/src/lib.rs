//! Pipeline orchestration for PaperPipe.
//!
//! This crate ties search, download, extraction, persistence, and embedding
//! into end-to-end workflows: [`pipeline::ingest`] and
//! [`embedding::embed_missing`].

pub mod embedding;
pub mod pipeline;
