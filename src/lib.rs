//! # Shipflow
//!
//! Linear-history git workflow engine for your terminal.
//!
//! Shipflow wraps the everyday branch lifecycle in a small set of
//! commands and keeps a crash-safe session per branch so every command can
//! be re-run after a failure:
//!
//! - **launch / hotfix**: validated branch names, never reusing a merged name
//! - **ship**: commit, push, pull request, checks, squash merge and cleanup
//! - **swap / switch**: move between branches without losing uncommitted work
//! - **abort**: drop a session without merging
//!
//! ## Quick Start
//!
//! ```bash
//! shipflow launch "add oauth login"
//! # ...hack...
//! shipflow ship --yes
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::redundant_closure_for_method_calls)]

pub mod core;
pub mod error;
pub mod git;
pub mod platform;
pub mod session;
pub mod testing;
pub mod validation;
pub mod workflow;

// Re-export commonly used types
pub use core::{CancelToken, Config};
pub use error::{WorkflowError, WorkflowResult};
pub use session::{SessionRepository, WorkflowSession, WorkflowState, WorkflowType};
pub use workflow::{Engine, Operation, Outcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "shipflow";
