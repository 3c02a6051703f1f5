//! Utilities for graft
//!
//! This module provides utility functions used across the library.

pub mod logging;
pub mod naming;
pub mod patterns;
pub mod prompt;

// Re-export key utility functions
pub use naming::{slugify, unquote_identifier, validate_branch_name};
pub use patterns::SqlPatterns;
pub use prompt::{Answer, Prompter, ScriptedPrompter, StdinPrompter};
