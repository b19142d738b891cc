//! # Convo Ingest
//!
//! Ingestion pipeline and collector event protocol for AI coding-assistant
//! conversation logs.
//!
//! Logs arrive from two independent producers: directories watched on the
//! local machine, and remote collectors pushing numbered events over HTTP.
//! Both feed one [`pipeline::IngestionPipeline`], the single place where
//! parsing, deduplication and persistence happen.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────┐
//! │ Watch        │──▶│           │   ┌──────────────┐   ┌──────────┐
//! │ Scheduler    │   │ Ingestion │──▶│ Parser       │   │  SQLite  │
//! └──────────────┘   │ Pipeline  │   │ Registry     │   │  Store   │
//! ┌──────────────┐   │           │──────────────────────▶│          │
//! │ Collector    │──▶│           │                       └──────────┘
//! │ HTTP (axum)  │   └───────────┘
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`parsers`] | Log format parsers and the registry that selects them |
//! | [`incremental`] | Checkpointed re-parsing of growing line-delimited logs |
//! | [`fingerprint`] | Message hashes and rolling conversation fingerprints |
//! | [`pipeline`] | Parse → dedup → persist, one job per unit of work |
//! | [`watch`] | Directory watch scheduler |
//! | [`collector`] | Collector registration, event protocol, and client |
//! | [`server`] | Collector HTTP server |
//! | [`store`] | Persistence gateway (SQLite and in-memory) |
//! | [`locks`] | Per-key mutual exclusion |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`logging`] | `tracing` subscriber setup |

pub mod collector;
pub mod collector_cmd;
pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod incremental;
pub mod ingest;
pub mod jobs;
pub mod locks;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod parsers;
pub mod pipeline;
pub mod server;
pub mod store;
pub mod watch;
pub mod watch_cmd;
