//! Source locations attached to values and instructions.

use std::fmt;

/// A point in a source text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    /// Identifier of the source text, assigned by the front end.
    pub source_id: u32,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

impl Position {
    /// Creates a position in source `0`.
    pub const fn new(line: u32, column: u32) -> Self {
        Self {
            source_id: 0,
            line,
            column,
        }
    }
}

/// A half-open source range `[begin, end)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Location {
    pub begin: Position,
    pub end: Position,
}

impl Location {
    /// Creates a location spanning `begin..end`.
    pub const fn new(begin: Position, end: Position) -> Self {
        Self { begin, end }
    }

    /// Creates a location covering a single line range.
    pub const fn line(line: u32, begin_column: u32, end_column: u32) -> Self {
        Self {
            begin: Position::new(line, begin_column),
            end: Position::new(line, end_column),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}.{}",
            self.begin.source_id, self.begin.line, self.begin.column
        )?;
        if self.end.line != self.begin.line {
            write!(f, "-{}.{}", self.end.line, self.end.column)
        } else if self.end.column > self.begin.column + 1 {
            write!(f, "-{}", self.end.column)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_single_line() {
        assert_eq!(Location::line(3, 5, 12).to_string(), "0:3.5-12");
        assert_eq!(Location::line(3, 5, 6).to_string(), "0:3.5");
    }

    #[test]
    fn display_multi_line() {
        let loc = Location::new(Position::new(1, 2), Position::new(4, 1));
        assert_eq!(loc.to_string(), "0:1.2-4.1");
    }
}
