//! Error types for the beat-code compiler.

use std::fmt;

/// An error that occurred while compiling beat code.
///
/// Carries the byte offset into the (comment-stripped) source where the
/// problem was detected, when one is known.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub message: String,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A duration chunk did not parse as an arithmetic expression, or the
    /// pattern grammar itself was violated.
    MalformedExpression,
    /// A computed interval exceeds the representable sample-count range.
    PatternTooSlow,
    /// An `@tag` names a source that is not in the catalog and no default
    /// substitute is configured.
    UnknownSoundSource,
    /// A `$N` reference points past the current layer count and the
    /// reference policy forbids clamping.
    ReferenceOutOfRange,
}

impl CompileError {
    pub fn malformed(message: impl Into<String>, offset: usize) -> Self {
        Self {
            kind: ErrorKind::MalformedExpression,
            message: message.into(),
            offset: Some(offset),
        }
    }

    pub fn too_slow(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::PatternTooSlow,
            message: message.into(),
            offset: None,
        }
    }

    pub fn unknown_source(tag: &str) -> Self {
        Self {
            kind: ErrorKind::UnknownSoundSource,
            message: format!("unknown sound source '@{tag}'"),
            offset: None,
        }
    }

    pub fn bad_reference(index: usize, layer_count: usize) -> Self {
        Self {
            kind: ErrorKind::ReferenceOutOfRange,
            message: format!("reference ${index} exceeds layer count {layer_count}"),
            offset: None,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(off) => write!(f, "{:?} at offset {}: {}", self.kind, off, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_offset() {
        let e = CompileError::malformed("bad token", 7);
        let s = e.to_string();
        assert!(s.contains("offset 7"));
        assert!(s.contains("bad token"));
        assert_eq!(e.kind, ErrorKind::MalformedExpression);
    }

    #[test]
    fn display_without_offset() {
        let e = CompileError::too_slow("interval overflows");
        assert!(e.to_string().contains("PatternTooSlow"));
        assert!(e.offset.is_none());
    }

    #[test]
    fn unknown_source_names_tag() {
        let e = CompileError::unknown_source("zz9");
        assert!(e.to_string().contains("@zz9"));
        assert_eq!(e.kind, ErrorKind::UnknownSoundSource);
    }

    #[test]
    fn bad_reference_mentions_both_numbers() {
        let e = CompileError::bad_reference(5, 2);
        assert!(e.to_string().contains('5'));
        assert!(e.to_string().contains('2'));
    }
}
