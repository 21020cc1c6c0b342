// Warning groups (as of rust 1.55)
#![deny(
    future_incompatible,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2021_compatibility,
    rust_2018_idioms
)]
#![warn(unused)]

//! External binaries and compression helpers.
//!
//! The aligner, pileup and index tools are opaque subprocesses with fixed argv
//! contracts. [`ToolPaths`] resolves them, [`ToolCommand`] runs them with
//! captured output, and [`compress`] handles the `.bz2` artifacts they
//! exchange through the object store.

mod command;
pub mod compress;
pub mod testing;
mod tools;

pub use command::{ToolCommand, ToolError, ToolOutput, ToolProcess};
pub use tools::{names, ToolPaths};
