// Warning groups (as of rust 1.55)
#![deny(
    future_incompatible,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2021_compatibility,
    rust_2018_idioms
)]
#![warn(unused)]

//! Task invocation.
//!
//! A stage hands a bag of independent arguments to an [`Executor`], which
//! runs one task per argument with bounded concurrency, a wall-clock timeout
//! and a retry budget, and returns the results in submission order.
//! [`ResumeCache`] persists the result set of finished stages so a restarted
//! run skips them.

mod executor;
mod resume;

pub use executor::{Executor, LocalExecutor, TaskError, TaskPolicy};
pub use resume::ResumeCache;
