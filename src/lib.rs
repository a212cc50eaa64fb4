//! `substep` step execution engine.
//!
//! A step is a sequence of directives (`input:`, `output:`, `depends:`,
//! `task:`) followed by a body. This crate resolves the step input into
//! targets (`resolve`, `target`), partitions it into substep groups
//! (`grouping`), applies the remaining directives to each substep
//! (`directive`), consults run signatures to skip work that is already done
//! (`signature`), and dispatches bodies inline, on a bounded worker pool, or
//! through a task queue (`execute`).
//!
//! Invariants:
//! - substep results are reported in group order regardless of dispatch mode
//! - outputs of different substeps never overlap
//! - worker slots and signature locks are released on every exit path

pub mod bounded_executor;
pub mod config;
pub mod context;
pub mod directive;
pub mod error;
pub mod execute;
pub mod executor;
pub mod grouping;
pub mod resolve;
pub mod schema;
pub mod signature;
pub mod slots;
pub mod step;
pub mod target;
pub mod task;
pub mod trace;
