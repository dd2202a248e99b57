//! sandshell - safety validation and sandboxed execution for shell commands
//! generated by a language model against a user's real files.
//!
//! This crate provides:
//! - Path translation between the host view and the sandbox view
//! - A deny-by-default command validator
//! - A container executor with a lazily created, serialized sandbox
//! - A hash-chained audit log
//! - The [`Pipeline`] tying them together

pub mod cli;
pub mod config;
pub mod error;
pub mod paths;
pub mod pipeline;
pub mod sandbox;
pub mod security;
pub mod shell;

pub use config::Config;
pub use pipeline::{Pipeline, PipelineOutput};
