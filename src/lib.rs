//! # Windlass: LLM Cascade Execution Engine
//!
//! Windlass runs declaratively-specified multi-cell workflows ("cascades")
//! that interleave deterministic data cells (SQL, Python, JavaScript,
//! Clojure) with non-deterministic LLM cells.
//!
//! ## Core Concepts
//!
//! - **Cascade**: an ordered list of cells executed as a unit
//! - **Cell**: one step; either a deterministic executor or an LLM turn loop
//! - **Sounding / take**: one of N parallel attempts for a cell; an
//!   evaluator picks the winner
//! - **Reforge**: iterative refinement of the winning take
//! - **Ward**: a validator at a cell boundary (blocking / retry / advisory)
//! - **Checkpoint**: a blocking human-in-the-loop request mid-cascade
//! - **Echo**: the unified log every runtime event is appended to, with
//!   deferred cost reconciliation and a live in-memory mirror
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use windlass::cascade::spec::CascadeSpec;
//! use windlass::config::WindlassConfig;
//! use windlass::runner::{CascadeRunner, RunOptions};
//! use serde_json::json;
//!
//! # async fn example() -> miette::Result<()> {
//! let cfg = WindlassConfig::from_env();
//! let runner = CascadeRunner::bootstrap(cfg).await?;
//! let spec = CascadeSpec::from_path("cascades/triage.yaml")?;
//! let outcome = runner
//!     .run(&spec, json!({"ticket": "printer on fire"}), RunOptions::default())
//!     .await?;
//! println!("{}", outcome.final_output);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`cascade`] - Cascade specs, templating, and registries
//! - [`runner`] - The cascade runner and cell state machine
//! - [`agent`] - Provider-backed LLM agent and token budgeter
//! - [`echo`] - Unified log, live mirror, and cost reconciler
//! - [`session`] - Durable session state, session DBs, checkpoints
//! - [`events`] - Lifecycle event bus with pluggable sinks
//! - [`bridge`] - SQL UDF bridge and the `THEN <STAGE>` pipeline
//! - [`server`] - HTTP control surface (sessions, checkpoints, SSE)

pub mod agent;
pub mod bridge;
pub mod cascade;
pub mod config;
pub mod echo;
pub mod events;
pub mod frame;
pub mod runner;
pub mod server;
pub mod session;
