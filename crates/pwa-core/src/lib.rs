//! # pwa-core
//!
//! Shared kernel of the pwa-engine workspace: the error type, the objective
//! trait consumed by external minimizers, and serializable result summaries.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use types::{EvaluationSummary, FitFraction};
