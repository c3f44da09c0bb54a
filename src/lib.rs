//! # Opflow
//!
//! A command-pattern operation engine: compose trees of reversible
//! operations that execute in a defined order, retry on failure, and can be
//! undone in the exact reverse of the order in which they succeeded.
//!
//! Opflow provides:
//!
//! - **Ternary operation trees**: every node wraps its own action between a
//!   before child and an after child
//! - **Dynamic grafts**: a running operation may attach new subtrees onto
//!   itself, which execute inside the current walk and unwind with it
//! - **Bounded retries**: per-walk retry policies with backoff and jitter
//! - **Mirror-order undo**: partial work rolls back in exactly the reverse
//!   of the order it succeeded
//! - **Lifecycle hooks**: exec-only, undo-only, and shared hooks around
//!   every phase, including per-attempt hooks inside the retry loops
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use opflow::prelude::*;
//!
//! let provision = Operation::builder()
//!     .exec(async_action(|args| async move { /* create the resource */ }))
//!     .undo(async_action(|args| async move { /* tear it down */ }))
//!     .build();
//!
//! let root = provision.create(serde_json::json!({"region": "us-east-1"}));
//! root.add_child(provision.create(serde_json::json!({"region": "eu-west-1"})))?;
//!
//! match root.exec().await {
//!     Ok(results) => { /* everything ran */ }
//!     Err(_) => { root.undo().await?; /* roll back what did run */ }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod action;
pub mod context;
pub mod errors;
mod executor;
pub mod handle;
pub mod hooks;
pub mod operation;
pub mod outcome;
pub mod parallel;
pub mod retry;
pub mod runtime;
pub mod testing;
mod undoer;

#[cfg(test)]
mod integration_tests;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::action::{
        action, async_action, ActionArgs, ActionFailure, ActionFn, ActionOutput, ActionResult,
    };
    pub use crate::context::{ContextSnapshot, DuringSlot, PhaseFlags};
    pub use crate::errors::{EngineError, EngineResult};
    pub use crate::handle::{ChildSpec, Handle, WeakHandle};
    pub use crate::hooks::{HookKind, HookPoint, Hooks};
    pub use crate::operation::{Operation, OperationBuilder};
    pub use crate::outcome::Outcome;
    pub use crate::parallel::group;
    pub use crate::retry::{
        BackoffStrategy, JitterStrategy, RetryPolicy, DEFAULT_NUM_TRIES,
        DEFAULT_RETRY_INTERVAL_MS,
    };
    pub use crate::runtime::{Clock, ExecId, IdSource, TokioClock, UuidIdSource};
}
