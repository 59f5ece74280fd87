//! Errors reported to callers of the compiler.
//!
//! Only problems with the *input* are represented here. Broken compiler
//! invariants (a stack-depth mismatch at a merge point, an unbalanced handler
//! range stack, an unclassified name) indicate a bug in the emitter and panic.

use std::borrow::Cow;

use thiserror::Error;

use crate::location::CodeRange;

/// Error returned when a source unit cannot be compiled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The source is invalid Python, or valid Python the compiler rejects.
    #[error("SyntaxError: {msg} at {range}")]
    Syntax { msg: Cow<'static, str>, range: CodeRange },
    /// A construct the compiler does not lower yet.
    #[error("NotSupported: {construct} is not supported at {range}")]
    NotSupported {
        construct: Cow<'static, str>,
        range: CodeRange,
    },
    /// The input exceeds a structural limit: nesting depth or jump distance.
    #[error("ResourceLimit: {msg} at {range}")]
    ResourceLimit { msg: Cow<'static, str>, range: CodeRange },
}

impl CompileError {
    pub(crate) fn syntax(msg: impl Into<Cow<'static, str>>, range: CodeRange) -> Self {
        Self::Syntax { msg: msg.into(), range }
    }

    pub(crate) fn not_supported(construct: impl Into<Cow<'static, str>>, range: CodeRange) -> Self {
        Self::NotSupported {
            construct: construct.into(),
            range,
        }
    }

    pub(crate) fn resource_limit(msg: impl Into<Cow<'static, str>>, range: CodeRange) -> Self {
        Self::ResourceLimit { msg: msg.into(), range }
    }

    /// The source range the error points at.
    #[must_use]
    pub fn range(&self) -> CodeRange {
        match self {
            Self::Syntax { range, .. } | Self::NotSupported { range, .. } | Self::ResourceLimit { range, .. } => *range,
        }
    }

    /// The error message without its kind prefix or location.
    #[must_use]
    pub fn message(&self) -> Cow<'_, str> {
        match self {
            Self::Syntax { msg, .. } | Self::ResourceLimit { msg, .. } => Cow::Borrowed(msg),
            Self::NotSupported { construct, .. } => Cow::Owned(format!("{construct} is not supported")),
        }
    }

    /// The kind name reported to `Diagnostics::on_error`.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Syntax { .. } => ErrorKind::Syntax,
            Self::NotSupported { .. } => ErrorKind::NotSupported,
            Self::ResourceLimit { .. } => ErrorKind::ResourceLimit,
        }
    }
}

/// Classification passed to diagnostics callbacks alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum ErrorKind {
    Syntax,
    NotSupported,
    ResourceLimit,
}

/// Classification of non-fatal diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum WarningKind {
    /// A construct that is valid but almost certainly not what was meant.
    Syntax,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::CodeLoc;

    #[test]
    fn display_includes_kind_and_range() {
        let range = CodeRange::new(CodeLoc::new(3, 4), CodeLoc::new(3, 9));
        let err = CompileError::syntax("'break' outside loop", range);
        assert_eq!(err.to_string(), "SyntaxError: 'break' outside loop at 3:4-3:9");
        assert_eq!(err.range(), range);
        assert_eq!(err.kind(), ErrorKind::Syntax);

        let err = CompileError::not_supported("match statement", range);
        assert_eq!(err.message(), "match statement is not supported");
    }
}
