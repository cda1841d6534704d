//! # Context Foundry
//!
//! A knowledge-base retrieval and context-assembly core for LLM document
//! drafting: it turns a free-text query into a token-budgeted,
//! conflict-checked, ranked set of text passages ready for prompt
//! construction.
//!
//! ## Pipeline
//!
//! ```text
//! query ──▶ HyDE? ──▶ embed ──┐
//!   │                         ▼
//!   │                  ┌────────────┐      ┌───────────────────────┐
//!   └── BM25 (FTS5) ──▶│  RRF fuse  │─────▶│ score → filter →      │
//!       dense (vec) ──▶│  top-k     │      │ conflicts → budget    │
//!                      └────────────┘      └──────────┬────────────┘
//!                                                     ▼
//!                                            AssembledContext
//! ```
//!
//! Three retrieval signals feed one deterministic fusion: sparse lexical
//! search, dense vector search, and LLM relevance/conflict judging. Every
//! LLM-dependent step degrades gracefully (raw query on HyDE failure, max
//! scores on scorer failure, no conflicts on detector failure); the only
//! fatal error is a missing vector index for the configured embedding model.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation and vector-table management |
//! | [`repository`] | Chunk store, FTS5 and vector search, summaries |
//! | [`embedding`] | Embedding capability and vector utilities |
//! | [`llm`] | Completion capability and token counting |
//! | [`retriever`] | HyDE expansion and reciprocal rank fusion |
//! | [`assembler`] | Relevance scoring, conflict detection, token budget |

pub mod assembler;
pub mod config;
pub mod db;
pub mod embedding;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod repository;
pub mod retriever;
