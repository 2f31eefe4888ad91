use kindc_types::{CompileError, ErrorCode, Span};
use thiserror::Error;

/// Faults raised while lowering, emitting, assembling or patching.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodegenError {
    #[error("unsupported syntax: {0}")]
    UnsupportedSyntax(String),
    #[error("unsupported type: {0}")]
    UnsupportedType(String),
    #[error("unresolved native: {0}")]
    UnresolvedNative(String),
    #[error("invalid default argument: {0}")]
    InvalidDefaultArgument(String),
    #[error("missing template marker: {0}")]
    MissingTemplateMarker(String),
    #[error("invalid template: {0}")]
    InvalidTemplate(String),
    #[error("program too big: {0}")]
    TemplateOverflow(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("assembly failed: {0}")]
    Assembly(String),
    #[error("internal compiler error: {0}")]
    InternalInvariant(String),
}

pub type CodegenResult<T> = Result<T, CodegenError>;

impl CodegenError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnsupportedSyntax(_) => ErrorCode::UNSUPPORTED_SYNTAX,
            Self::UnsupportedType(_) => ErrorCode::UNSUPPORTED_TYPE,
            Self::UnresolvedNative(_) => ErrorCode::UNRESOLVED_NATIVE,
            Self::InvalidDefaultArgument(_) => ErrorCode::INVALID_DEFAULT_ARGUMENT,
            Self::MissingTemplateMarker(_) => ErrorCode::MISSING_TEMPLATE_MARKER,
            Self::InvalidTemplate(_) => ErrorCode::INVALID_TEMPLATE,
            Self::TemplateOverflow(_) => ErrorCode::TEMPLATE_OVERFLOW,
            Self::LimitExceeded(_) => ErrorCode::LIMIT_EXCEEDED,
            Self::Assembly(_) => ErrorCode::ASSEMBLY_FAILED,
            Self::InternalInvariant(_) => ErrorCode::INTERNAL_INVARIANT,
        }
    }

    /// Attach a source location, producing a reportable error.
    pub fn at(&self, file: &str, span: Span) -> CompileError {
        CompileError::new(file, self.code(), self.to_string(), span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindc_types::ErrorCategory;

    #[test]
    fn faults_map_to_categories() {
        let err = CodegenError::UnsupportedSyntax("SwitchStatement".into());
        let reported = err.at("main.ts", Span::point(4, 1));
        assert_eq!(reported.category, ErrorCategory::Syntax);
        assert_eq!(reported.message, "unsupported syntax: SwitchStatement");

        assert!(CodegenError::InternalInvariant("x".into()).code().is_internal());
        assert_eq!(
            CodegenError::MissingTemplateMarker("jump start".into())
                .code()
                .category(),
            ErrorCategory::Template
        );
    }
}
