//! Shared types for the kindc compiler.
//!
//! This crate defines the typed declaration tree handed over by the
//! external parser/checker, source spans, doc-comment attributes, and the
//! structured error types reported by every compiler stage.

mod attrs;
mod error;
mod span;
pub mod ast;
pub mod builder;

pub use attrs::Attrs;
pub use builder::ProgramBuilder;
pub use error::{CompileError, CompileErrors, ErrorCategory, ErrorCode, MAX_ERRORS};
pub use span::Span;

/// Result type used throughout the kindc compiler.
pub type Result<T> = std::result::Result<T, CompileError>;
