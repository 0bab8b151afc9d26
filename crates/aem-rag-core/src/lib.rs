//! # aem-rag core
//!
//! Shared, I/O-free logic for aem-rag: the flat record data model, the
//! content-tree flattener, vector utilities, the flat vector index, and the
//! hybrid merge used at query time.
//!
//! This crate contains no tokio, sqlx, filesystem or network code. Everything
//! here is a deterministic function of its inputs, which is what lets the
//! application crate checkpoint and resume work around it.

pub mod embedding;
pub mod flatten;
pub mod merge;
pub mod models;
pub mod vector_index;
