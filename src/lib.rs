//! Template-driven machine state capture and restore engine.
//!
//! Reads a declarative TOML template describing machine state — files,
//! hierarchical key-value (registry) entries, application inventories — and
//! either captures that state into a portable artifact directory (backup) or
//! re-applies a previously captured artifact directory (restore).
//!
//! The public API is organised into layers:
//!
//! - **[`template`]** — parse, validate, and merge template documents
//! - **[`state`]** — per-kind state managers (`capture` + `apply` pattern)
//! - **[`orchestrator`]** — the engine entry point consumed by the CLI
//!
//! Supporting modules: [`paths`] (address resolution), [`prereq`]
//! (prerequisite gating), [`crypto`] (artifact encryption), [`artifact`]
//! (artifact directory and manifest handling), [`exec`] (external command
//! execution), and [`facts`] (machine facts).
#![deny(clippy::or_fun_call)]
#![deny(clippy::bool_to_int_with_if)]

pub mod artifact;
pub mod cli;
pub mod context;
pub mod crypto;
pub mod error;
pub mod exec;
pub mod facts;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod prereq;
pub mod state;
pub mod template;
