//! Source positions attached to AST nodes, instructions and errors.

use std::fmt;

use ruff_text_size::TextRange;
use serde::{Deserialize, Serialize};

/// A position in the source: 1-based line, 0-based column in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CodeLoc {
    pub line: u32,
    pub column: u32,
}

impl CodeLoc {
    #[must_use]
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for CodeLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A half-open source range.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeRange {
    pub start: CodeLoc,
    pub end: CodeLoc,
}

/// Custom Debug implementation to keep dumps of instruction lists readable.
impl fmt::Debug for CodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl fmt::Display for CodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl CodeRange {
    #[must_use]
    pub const fn new(start: CodeLoc, end: CodeLoc) -> Self {
        Self { start, end }
    }
}

/// Maps byte offsets produced by the parser to line/column positions.
#[derive(Debug, Clone)]
pub struct LineIndex {
    /// Byte offset of every `\n` in the source.
    line_ends: Vec<usize>,
}

impl LineIndex {
    #[must_use]
    pub fn new(source: &str) -> Self {
        let line_ends = source
            .bytes()
            .enumerate()
            .filter_map(|(i, b)| (b == b'\n').then_some(i))
            .collect();
        Self { line_ends }
    }

    /// Converts a ruff text range to a `CodeRange`.
    #[must_use]
    pub fn range(&self, range: TextRange) -> CodeRange {
        CodeRange::new(self.position(range.start().into()), self.position(range.end().into()))
    }

    /// Converts a byte offset to a position.
    #[must_use]
    pub fn position(&self, offset: usize) -> CodeLoc {
        // number of newlines strictly before `offset` is the 0-based line
        let line_no = self.line_ends.partition_point(|&end| end < offset);
        let line_start = if line_no == 0 { 0 } else { self.line_ends[line_no - 1] + 1 };
        CodeLoc::new(to_u32(line_no + 1), to_u32(offset - line_start))
    }

    /// Number of lines in the source, counting a trailing partial line.
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.line_ends.len() + 1
    }
}

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_one_based_lines_zero_based_columns() {
        let index = LineIndex::new("ab\ncd\n\nef");
        assert_eq!(index.position(0), CodeLoc::new(1, 0));
        assert_eq!(index.position(2), CodeLoc::new(1, 2));
        assert_eq!(index.position(3), CodeLoc::new(2, 0));
        assert_eq!(index.position(6), CodeLoc::new(3, 0));
        assert_eq!(index.position(8), CodeLoc::new(4, 1));
        assert_eq!(index.line_count(), 4);
    }

    #[test]
    fn columns_count_bytes() {
        let index = LineIndex::new("é = 1\nx");
        assert_eq!(index.position(5), CodeLoc::new(1, 5));
        assert_eq!(index.position(7), CodeLoc::new(2, 0));
    }
}
