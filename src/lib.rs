//! # Kenny
//!
//! **A local-first personal data platform.**
//!
//! Kenny ingests a user's communication and productivity artifacts —
//! mail, calendar, reminders, notes, contacts, chat messages, files —
//! into a single content-addressed SQLite store, indexes them for keyword
//! and semantic retrieval, and executes user tasks through a
//! deterministic plan-confirm-execute engine with rollback and audit.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ Extractors │──▶│   Ingest      │──▶│   SQLite     │
//! │ mail/cal/… │   │ chunk+link   │   │ FTS5 + vec  │
//! └────────────┘   └──────────────┘   └──────┬──────┘
//!                                            │
//!            ┌───────────────┬───────────────┤
//!            ▼               ▼               ▼
//!      ┌──────────┐   ┌────────────┐   ┌──────────┐
//!      │  Hybrid  │   │    Plan    │   │  Stats   │
//!      │  search  │◀──│  engine    │   │          │
//!      └──────────┘   └─────┬──────┘   └──────────┘
//!                           │ rollback + audit
//!                           ▼
//!                     ┌────────────┐
//!                     │ Tool calls │
//!                     └────────────┘
//! ```
//!
//! ## Data flow
//!
//! 1. **Extractors** ([`extractor`]) pull normalized [`models::SourceRecord`]s
//!    in batches; how they read their source never leaks past the trait.
//! 2. The **ingest coordinator** ([`ingest`]) applies delta semantics:
//!    content-hash skip, in-place upsert, tombstones, relationship edges.
//! 3. The **chunker** ([`chunker`]) slices content into deterministic,
//!    non-overlapping chunks; the **vector index** ([`vector`]) holds their
//!    embeddings, repopulated by a background job.
//! 4. **Hybrid search** ([`search`]) fuses BM25 and cosine scores with
//!    progressive fallback thresholds and `<mark>` snippets.
//! 5. The **plan engine** ([`plan`]) turns a query into typed tool steps,
//!    gates mutations behind a SHA-256 operation hash, executes
//!    sequentially, and compensates completed steps in reverse on failure
//!    ([`compensation`]).
//! 6. Every transition lands in the correlation-stamped NDJSON **audit
//!    log** ([`audit`]).
//!
//! ## Quick start
//!
//! ```bash
//! kenny init                        # create the store
//! kenny ingest --full               # pull every configured source
//! kenny ingest_embeddings           # build the vector index
//! kenny search "quarterly budget"
//! kenny hybrid_search "lunch plans" --bm25-weight 0.7 --embedding-weight 0.3
//! kenny plan "remind me to call Jane tomorrow"
//! kenny execute <plan_id> --operation-hash <hash>
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with `KENNY_*` environment overrides |
//! | [`error`] | Typed error enum shared by every subsystem |
//! | [`models`] | Typed records: documents, side records, chunks, relationships |
//! | [`db`] | SQLite pool: WAL, FK enforcement, mmap hint |
//! | [`migrate`] | Numbered idempotent migrations |
//! | [`store`] | Unified content store: FK-safe upserts, FTS sync, stale sweep |
//! | [`chunker`] | Kind-aware deterministic chunker |
//! | [`embedding`] | Embedder trait: Ollama, deterministic hash projection |
//! | [`vector`] | Cosine top-k over stored vectors |
//! | [`extractor`] | Source extractor contract + NDJSON directory extractor |
//! | [`ingest`] | Sequential multi-source ingest with delta semantics |
//! | [`search`] | Hybrid BM25 + vector fusion with progressive thresholds |
//! | [`query`] | Bypassable query enhancement (intent, entities) |
//! | [`tools`] | Typed tool catalog with JSON-schema validation |
//! | [`plan`] | Plan state machine, operation hash, planner fallback |
//! | [`compensation`] | Inverse-op / data-restore / manual rollback |
//! | [`jobs`] | Background processor: priorities, jittered retries |
//! | [`audit`] | Append-only rotating NDJSON audit stream |
//! | [`engine`] | Facade wiring the subsystems for one installation |
//! | [`stats`] | Counts and health overview |

pub mod audit;
pub mod chunker;
pub mod compensation;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod jobs;
pub mod migrate;
pub mod models;
pub mod plan;
pub mod query;
pub mod search;
pub mod stats;
pub mod store;
pub mod tools;
pub mod vector;
