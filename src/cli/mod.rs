//! CLI module
//!
//! Command handlers behind the `bitmessage` binary.

pub mod commands;

pub use commands::*;
