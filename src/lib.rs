#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Workflow Engine
//!
//! Lifecycle and approval orchestration core for a multi-tenant
//! business-operations platform.
//!
//! ## Overview
//!
//! The engine governs how business entities (purchase orders, invoices,
//! employee records) move through configurable state machines, and how
//! multi-stage approval chains resolve against them. Definitions are
//! tenant-scoped configuration; running instances bind to immutable
//! definition version snapshots so in-flight work is never rewired by an
//! edit.
//!
//! ## Architecture
//!
//! Every mutating operation is split into a **pure planner** and an **atomic
//! commit**. Planners ([`state_machine::plan_transition`], the
//! [`approval::Orchestrator`]) validate against current state and produce the
//! full set of row mutations; the [`storage::Store`] applies them as one
//! change set. Optimistic row versions turn lost-update races into retried
//! plans, and durable timer schedule rows make deadlines survive restarts.
//!
//! ## Module Organization
//!
//! - [`models`] - One struct per `wf.*` table
//! - [`state_machine`] - Lifecycle graph validation and transition planning
//! - [`approval`] - Stage/quorum resolution, assignment, escalation
//! - [`scheduler`] - Durable timers over a pluggable wake-up substrate
//! - [`authz`] - Persona/capability authorization index
//! - [`refdata`] - Currency reference data for amount-threshold conditions
//! - [`storage`] - Store trait with PostgreSQL and in-memory backends
//! - [`engine`] - The facade tying it all together
//! - [`events`] - Post-commit broadcast notifications
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wf_engine::approval::StaticDirectoryResolver;
//! use wf_engine::config::EngineConfig;
//! use wf_engine::engine::Engine;
//! use wf_engine::refdata::StaticCurrencyTable;
//! use wf_engine::scheduler::NullSubstrate;
//! use wf_engine::storage::MemoryStore;
//!
//! let engine = Engine::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(NullSubstrate),
//!     Arc::new(StaticDirectoryResolver::new()),
//!     Arc::new(StaticCurrencyTable::default()),
//!     EngineConfig::default(),
//! );
//! ```

pub mod approval;
pub mod authz;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod refdata;
pub mod scheduler;
pub mod state_machine;
pub mod storage;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};

pub use approval::{Decision, StageOutcome};
pub use authz::ActorContext;
pub use models::EntityRef;
pub use state_machine::TransitionResult;
