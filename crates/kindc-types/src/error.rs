use crate::Span;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of errors stored before further ones are only counted.
pub const MAX_ERRORS: usize = 20;

/// Error category, determined by error code range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Syntax,
    Type,
    Native,
    Argument,
    Template,
    Limit,
    Internal,
}

/// Numeric error code (E100–E999).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    // ── Syntax (E100–E199) ──
    pub const UNSUPPORTED_SYNTAX: Self = Self(100);

    // ── Types (E200–E299) ──
    pub const UNSUPPORTED_TYPE: Self = Self(200);

    // ── Native binding (E300–E399) ──
    pub const UNRESOLVED_NATIVE: Self = Self(300);

    // ── Arguments (E400–E499) ──
    pub const INVALID_DEFAULT_ARGUMENT: Self = Self(400);

    // ── Template and assembly (E500–E599) ──
    pub const MISSING_TEMPLATE_MARKER: Self = Self(500);
    pub const INVALID_TEMPLATE: Self = Self(501);
    pub const TEMPLATE_OVERFLOW: Self = Self(502);
    pub const ASSEMBLY_FAILED: Self = Self(503);

    // ── Limits (E600–E699) ──
    pub const LIMIT_EXCEEDED: Self = Self(600);

    // ── Compiler defects (E900–E999) ──
    pub const INTERNAL_INVARIANT: Self = Self(900);

    /// Get the category for this error code.
    pub fn category(self) -> ErrorCategory {
        match self.0 {
            100..=199 => ErrorCategory::Syntax,
            200..=299 => ErrorCategory::Type,
            300..=399 => ErrorCategory::Native,
            400..=499 => ErrorCategory::Argument,
            500..=599 => ErrorCategory::Template,
            600..=699 => ErrorCategory::Limit,
            _ => ErrorCategory::Internal,
        }
    }

    /// Internal faults point at a compiler defect, not at the user program.
    pub fn is_internal(self) -> bool {
        self.category() == ErrorCategory::Internal
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::Type => write!(f, "type"),
            Self::Native => write!(f, "native"),
            Self::Argument => write!(f, "argument"),
            Self::Template => write!(f, "template"),
            Self::Limit => write!(f, "limit"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// A structured, source-attributed compiler fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileError {
    /// Source file name.
    pub file: String,
    pub code: ErrorCode,
    /// Derived from `code`.
    pub category: ErrorCategory,
    pub message: String,
    #[serde(flatten)]
    pub span: Span,
    /// Kind of the syntax node the fault was recorded against, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

impl CompileError {
    /// Create a new error.
    pub fn new(
        file: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
        span: Span,
    ) -> Self {
        Self {
            file: file.into(),
            code,
            category: code.category(),
            message: message.into(),
            span,
            node: None,
        }
    }

    /// Attach the kind of the offending syntax node.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} [{}] {}",
            self.span, self.code, self.category, self.message
        )
    }
}

impl std::error::Error for CompileError {}

/// Accumulated faults of one compilation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompileErrors {
    pub errors: Vec<CompileError>,
    pub total_errors: usize,
}

impl CompileErrors {
    /// Create an empty result (no errors).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn has_errors(&self) -> bool {
        self.total_errors > 0
    }

    /// Add an error, respecting the MAX_ERRORS limit.
    pub fn push_error(&mut self, error: CompileError) {
        if self.errors.len() < MAX_ERRORS {
            self.errors.push(error);
        }
        self.total_errors += 1;
    }

    /// Whether any stored error is a compiler defect.
    pub fn has_internal(&self) -> bool {
        self.errors.iter().any(|e| e.code.is_internal())
    }
}

impl FromIterator<CompileError> for CompileErrors {
    fn from_iter<I: IntoIterator<Item = CompileError>>(iter: I) -> Self {
        let mut errs = Self::empty();
        for e in iter {
            errs.push_error(e);
        }
        errs
    }
}
