//! # AEM RAG
//!
//! Retrieval-augmented question answering over an Adobe Experience Manager
//! content repository.
//!
//! The repository is crawled over its JSON selector API, each node is
//! flattened into a text record, and the records are embedded into a flat
//! vector index that survives interruption through an atomic checkpoint.
//! Questions are answered from dense and keyword hits merged into a single
//! context.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │  AEM JSON   │──▶│   Crawler   │──▶│ corpus.jsonl │
//! │  selectors  │   │  + flatten  │   └──────┬───────┘
//! └─────────────┘   └─────────────┘          │
//!                                            ▼
//!                   ┌─────────────┐   ┌──────────────┐
//!                   │   Indexer   │──▶│ vectors +    │
//!                   │ (resumable) │   │ checkpoint   │
//!                   └─────────────┘   └──────┬───────┘
//!                                            │
//!                      ┌─────────────────────┤
//!                      ▼                     ▼
//!                 ┌──────────┐         ┌──────────┐
//!                 │   CLI    │         │   HTTP   │
//!                 │ (aemrag) │         │  /query  │
//!                 └──────────┘         └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! aemrag crawl                        # write the flattened corpus
//! aemrag index build                  # embed it, resuming if interrupted
//! aemrag search "hero banner"
//! aemrag ask "list the page components" --format json
//! aemrag serve                        # POST /query on [server].bind
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and credential resolution |
//! | [`content_source`] | HTTP access to the repository's JSON selectors |
//! | [`crawl`] | Depth-first crawl and corpus files |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index_store`] | Atomic persistence, checkpoints, and the run lock |
//! | [`indexer`] | Checkpointed batch embedding |
//! | [`keyword`] | FTS5 keyword index |
//! | [`retrieve`] | Dense, sparse, and hybrid retrieval |
//! | [`llm`] | Prompt selection and answer generation |
//! | [`server`] | HTTP answer server and the `ask` command |
//! | [`progress`] | Progress reporting for long-running commands |
//!
//! The I/O-free pieces (flattening, the vector index, result merging) live in
//! the `aem-rag-core` crate.

pub mod config;
pub mod content_source;
pub mod crawl;
pub mod embedding;
pub mod index_store;
pub mod indexer;
pub mod keyword;
pub mod llm;
pub mod progress;
pub mod retrieve;
pub mod server;
