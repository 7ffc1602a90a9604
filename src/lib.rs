//! # Ethos
//!
//! Grounded answers from a team's chat history.
//!
//! Ethos captures channel messages (including reply threads), turns them
//! into retrieval units, embeds them into a vector index, and answers
//! natural-language questions with citations and a confidence score. Every
//! outbound call (Slack, embedding service, chat completion, index storage)
//! runs behind a retry policy and a circuit breaker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌──────────────┐   ┌─────────┐   ┌──────────────┐
//! │  Slack  │──▶│ Ingest+Group │──▶│ Chunker │──▶│ Vector index │
//! │ (fetch) │   │ clean/thread │   │ overlap │   │ L2 + boost   │
//! └─────────┘   └──────────────┘   └─────────┘   └──────┬───────┘
//!                                                       │ search
//!                                                       ▼
//!                                               ┌──────────────┐
//!                                               │ Orchestrator │──▶ answer
//!                                               │ prompt + LLM │    sources
//!                                               └──────────────┘    confidence
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ethos fetch                          # capture the workspace
//! ethos index                          # group, chunk, embed, persist
//! ethos ask "who owns the deploy pipeline?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed errors and failure classification |
//! | [`resilience`] | Retry with backoff and circuit breaker |
//! | [`ingest`] | Message validation, cleaning and thread grouping |
//! | [`chunk`] | Overlapping text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index with channel filter and priority re-ranking |
//! | [`llm`] | Chat-completion client |
//! | [`answer`] | Answer orchestration, confidence and citations |
//! | [`slack`] | Workspace capture |
//! | [`search`] | `ethos search` |
//! | [`stats`] | `ethos stats` and `ethos channels` |

pub mod answer;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod http;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod models;
pub mod progress;
pub mod resilience;
pub mod search;
pub mod setup;
pub mod slack;
pub mod stats;
