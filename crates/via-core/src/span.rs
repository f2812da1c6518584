//! Source spans.
//!
//! A span locates a range of the original source text: a 1-based line, a
//! column that resets on each `\n`, and an absolute byte range `begin..end`.

/// A located range of source text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Span {
    /// 1-based source line of the first byte covered by this span.
    pub line: u32,
    /// 1-based column of the first byte, reset on each newline.
    pub column: u32,
    /// Absolute byte offset of the first byte covered by this span.
    pub begin: u32,
    /// Absolute byte offset one past the last byte covered by this span.
    pub end: u32,
}

impl Span {
    /// A zero-width span at the origin, used for synthesized nodes that have
    /// no corresponding source text (e.g. an implicitly appended `RETNIL`).
    pub const EMPTY: Self = Self { line: 1, column: 1, begin: 0, end: 0 };

    #[inline]
    #[must_use]
    pub const fn new(line: u32, column: u32, begin: u32, end: u32) -> Self {
        Self { line, column, begin, end }
    }

    /// Merge two spans into the smallest span covering both.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        let (first, second) = if self.begin <= other.begin { (self, other) } else { (other, self) };
        Self { line: first.line, column: first.column, begin: first.begin, end: second.end.max(first.end) }
    }
}
