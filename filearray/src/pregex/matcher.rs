//! A single typed placeholder within a filename pattern.

use std::fmt::{Display, Formatter};

/// One placeholder in a filename pattern.
///
/// A matcher names the coordinate whose value it captures, the element
/// describing what it matches, and its capture group in the compiled regex.
/// A dummy matcher still matches (keeping the filename well-formed) but its
/// capture carries no coordinate value and is discarded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Matcher {
    coord: String,
    element: String,
    pattern: String,
    group: usize,
    dummy: bool,
}

impl Display for Matcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "%({}:{}", self.coord, self.element)?;
        if self.dummy {
            write!(f, ":dummy")?;
        }
        write!(f, ")")
    }
}

impl Matcher {
    pub(super) fn new(
        coord: String,
        element: String,
        pattern: String,
        group: usize,
        dummy: bool,
    ) -> Self {
        Self {
            coord,
            element,
            pattern,
            group,
            dummy,
        }
    }

    /// Name of the coordinate this matcher captures a value for.
    #[must_use]
    pub fn coord(&self) -> &str {
        &self.coord
    }

    /// Element name (built-in or user-registered).
    #[must_use]
    pub fn element(&self) -> &str {
        &self.element
    }

    /// The sub-regex this matcher compiles to.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Capture group index in the compiled regex (1-based).
    #[must_use]
    pub fn group(&self) -> usize {
        self.group
    }

    /// Whether the capture is discarded after matching.
    #[must_use]
    pub fn is_dummy(&self) -> bool {
        self.dummy
    }
}
