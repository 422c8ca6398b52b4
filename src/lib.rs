//! # takeout-ingestor
//!
//! Ingests personal data exports (Claude conversations, Google Takeout,
//! saved artifacts) into a local multimedia library, and serves that library
//! to AI assistants through one small MCP query server per media kind.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────┐
//! │  Ingestors   │──▶│   Pipeline   │──▶│  SQLite   │
//! │ Claude/      │   │ Chunk+Embed  │   │ FTS5+Vec  │
//! │ Takeout/...  │   └──────────────┘   └─────┬─────┘
//! └──────────────┘                            │
//!                      ┌──────────────────────┤
//!                      ▼                      ▼
//!                 ┌──────────┐   ┌──────────────────────────┐
//!                 │   CLI    │   │ serve documents|audio|   │
//!                 │          │   │       video|images (MCP) │
//!                 └──────────┘   └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! takeout-ingest setup
//! takeout-ingest ingest ~/Downloads/takeout-2024.zip
//! takeout-ingest ingest ~/exports/claude --type claude
//! takeout-ingest search "lisbon trip"
//! takeout-ingest serve images
//! takeout-ingest mcp-config
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and storage home |
//! | [`models`] | Media kinds, items, chunks |
//! | [`ingestors`] | Export parsers and auto-detection |
//! | [`ingest`] | Batch ingestion pipeline |
//! | [`store`] | Document upsert, chunk replacement, run records |
//! | [`extract`] | Text from PDF, Office, and HTML files |
//! | [`chunk`] | Paragraph-aware text chunking |
//! | [`embedding`] | Embedding providers and vector helpers |
//! | [`search`] | Keyword, semantic, and hybrid search |
//! | [`media`] | Transcription and image description |
//! | [`library`] | Per-media insert, query, list, and get |
//! | [`tools`] | Tool trait and per-media tool registry |
//! | [`mcp`] | MCP bridge over the tool registry |
//! | [`server`] | Per-media HTTP/MCP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema setup |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod extract;
pub mod get;
pub mod ingest;
pub mod ingestors;
pub mod library;
pub mod mcp;
pub mod mcp_config;
pub mod media;
pub mod migrate;
pub mod models;
pub mod openai;
pub mod progress;
pub mod search;
pub mod server;
pub mod setup;
pub mod stats;
pub mod store;
pub mod tools;
