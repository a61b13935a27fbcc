//! Filename pattern compiler.
//!
//! A pre-regex is a filename pattern mixing literal regex text with typed
//! placeholders ("matchers") of the form `%(coord[:element][:custom=<regex>:][:dummy])`:
//!
//! - `coord` names the coordinate the matcher captures a value for;
//! - `element` names a registered sub-pattern ([`ElementRegistry`]), for
//!   instance `Y` (a four digit year) or `x` (a full date). When absent the
//!   matcher falls back to `char` (any non-whitespace run);
//! - `custom=<regex>:` supplies the sub-pattern verbatim. The regex is
//!   terminated by a colon, so it may not contain one;
//! - `dummy` marks a part of the filename that varies but carries no
//!   coordinate value. It still must match;
//! - `%%` stands for a literal percent sign.
//!
//! Compilation produces a standard [`regex::Regex`] with one capture group
//! per matcher, plus the ordered matcher list. Literal text passes through
//! verbatim, so plain regex tokens may be embedded directly in the pattern;
//! such tokens are frozen to the text of the first matched file afterwards.

pub mod element;
pub mod matcher;

use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

pub use element::ElementRegistry;
pub use matcher::Matcher;

/// Errors from compiling a filename pattern. All are configuration errors,
/// surfaced before any file I/O.
#[derive(Debug, Error)]
pub enum PregexError {
    /// Matcher syntax that cannot be parsed.
    #[error("malformed matcher in pattern '{pattern}' at byte {position}")]
    Malformed {
        /// The full pattern.
        pattern: String,
        /// Byte offset of the offending matcher.
        position: usize,
    },
    /// A `custom=` clause missing its terminating colon.
    #[error("unterminated custom regex for coordinate '{0}' (terminate it with ':')")]
    UnterminatedCustom(String),
    /// An element name that is not registered.
    #[error("unknown matcher element '{0}'")]
    UnknownElement(String),
    /// The assembled regex failed to compile.
    #[error("pattern '{pattern}' compiles to an invalid regex")]
    InvalidRegex {
        /// The full pattern.
        pattern: String,
        /// The regex compilation failure.
        #[source]
        source: regex::Error,
    },
}

/// A compiled filename pattern: regex plus ordered matcher metadata.
#[derive(Clone, Debug)]
pub struct Pregex {
    source: String,
    regex: Regex,
    matchers: Vec<Matcher>,
}

impl Pregex {
    /// Compile `pattern` with the built-in elements.
    ///
    /// # Errors
    /// Returns a [`PregexError`] for malformed matcher syntax, an
    /// unterminated custom regex, or an unknown element.
    pub fn compile(pattern: &str) -> Result<Self, PregexError> {
        Self::compile_with(pattern, &ElementRegistry::new(), &HashMap::new())
    }

    /// Compile `pattern` against an explicit registry, fixing some matchers.
    ///
    /// Matchers whose coordinate appears in `fixed` are replaced by the given
    /// literal text: they no longer capture and do not appear in the matcher
    /// list. This pins a pattern to one value of a coordinate.
    ///
    /// # Errors
    /// Same as [`Pregex::compile`].
    pub fn compile_with(
        pattern: &str,
        registry: &ElementRegistry,
        fixed: &HashMap<String, String>,
    ) -> Result<Self, PregexError> {
        let mut regex_src = String::from("^");
        let mut matchers = Vec::new();
        let mut literal_since_group = true;

        let bytes = pattern.char_indices().collect::<Vec<_>>();
        let mut i = 0;
        while i < bytes.len() {
            let (pos, c) = bytes[i];
            if c != '%' {
                regex_src.push(c);
                literal_since_group = true;
                i += 1;
                continue;
            }
            match bytes.get(i + 1) {
                Some((_, '%')) => {
                    regex_src.push('%');
                    literal_since_group = true;
                    i += 2;
                }
                Some((_, '(')) => {
                    let (parsed, next) = RawMatcher::parse(pattern, pos, &bytes, i + 2)?;
                    i = next;
                    if let Some(literal) = fixed.get(&parsed.coord) {
                        regex_src.push_str(&regex::escape(literal));
                        literal_since_group = true;
                        continue;
                    }
                    let (element, sub_pattern) = parsed.resolve(registry)?;
                    if !literal_since_group && !matchers.is_empty() {
                        log::warn!(
                            "pattern '{pattern}': matchers for '{}' and '{}' are adjacent \
                             with no separating text; captures may be ambiguous",
                            matchers
                                .last()
                                .map_or("", |m: &Matcher| m.coord()),
                            parsed.coord,
                        );
                    }
                    regex_src.push('(');
                    regex_src.push_str(&sub_pattern);
                    regex_src.push(')');
                    matchers.push(Matcher::new(
                        parsed.coord,
                        element,
                        sub_pattern,
                        matchers.len() + 1,
                        parsed.dummy,
                    ));
                    literal_since_group = false;
                }
                _ => {
                    return Err(PregexError::Malformed {
                        pattern: pattern.to_string(),
                        position: pos,
                    })
                }
            }
        }
        regex_src.push('$');

        let regex = Regex::new(&regex_src).map_err(|source| PregexError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
            matchers,
        })
    }

    /// The pattern this was compiled from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The compiled regex (anchored at both ends).
    #[must_use]
    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// The ordered matcher list.
    #[must_use]
    pub fn matchers(&self) -> &[Matcher] {
        &self.matchers
    }

    /// Whether `filename` matches the whole pattern.
    #[must_use]
    pub fn is_match(&self, filename: &str) -> bool {
        self.regex.is_match(filename)
    }

    /// Captured text per matcher, in matcher order.
    ///
    /// Dummy matchers are included; callers skip them via
    /// [`Matcher::is_dummy`]. Returns [`None`] if `filename` does not match.
    #[must_use]
    pub fn captures(&self, filename: &str) -> Option<Vec<String>> {
        let caps = self.regex.captures(filename)?;
        Some(
            self.matchers
                .iter()
                .map(|m| caps.get(m.group()).map_or("", |g| g.as_str()).to_string())
                .collect(),
        )
    }

    /// Split a matched filename into alternating literal/captured pieces.
    ///
    /// For `n` matchers the result has `2n + 1` pieces: literal text at even
    /// positions, captured text at odd positions. Substituting other captures
    /// at the odd positions reconstructs sibling filenames.
    #[must_use]
    pub fn segments(&self, filename: &str) -> Option<Vec<String>> {
        let caps = self.regex.captures(filename)?;
        let mut segments = Vec::with_capacity(2 * self.matchers.len() + 1);
        let mut cursor = 0;
        for m in &self.matchers {
            let group = caps.get(m.group())?;
            segments.push(filename[cursor..group.start()].to_string());
            segments.push(group.as_str().to_string());
            cursor = group.end();
        }
        segments.push(filename[cursor..].to_string());
        Some(segments)
    }

    /// Rebuild a filename from [`Pregex::segments`] output, overriding the
    /// captures of some matchers.
    ///
    /// `overrides` pairs a matcher index (position in [`Pregex::matchers`])
    /// with replacement text. Matchers not overridden keep the capture of the
    /// file the segments came from.
    #[must_use]
    pub fn reconstruct(&self, segments: &[String], overrides: &[(usize, &str)]) -> String {
        let mut pieces: Vec<&str> = segments.iter().map(String::as_str).collect();
        for &(matcher, text) in overrides {
            if let Some(slot) = pieces.get_mut(2 * matcher + 1) {
                *slot = text;
            }
        }
        pieces.concat()
    }

    /// Indices (into [`Pregex::matchers`]) of non-dummy matchers for `coord`.
    #[must_use]
    pub fn matchers_of(&self, coord: &str) -> Vec<usize> {
        self.matchers
            .iter()
            .enumerate()
            .filter(|(_, m)| m.coord() == coord && !m.is_dummy())
            .map(|(i, _)| i)
            .collect()
    }
}

/// A matcher as parsed from the pattern, before element resolution.
struct RawMatcher {
    coord: String,
    element: Option<String>,
    custom: Option<String>,
    dummy: bool,
}

impl RawMatcher {
    /// Parse the body of `%(...)` starting at `start` (after the paren).
    /// Returns the matcher and the index after the closing paren.
    fn parse(
        pattern: &str,
        matcher_pos: usize,
        bytes: &[(usize, char)],
        start: usize,
    ) -> Result<(Self, usize), PregexError> {
        let malformed = || PregexError::Malformed {
            pattern: pattern.to_string(),
            position: matcher_pos,
        };
        let mut i = start;
        let mut read_token = |terminators: &[char]| -> Result<(String, char), PregexError> {
            let mut token = String::new();
            while let Some(&(_, c)) = bytes.get(i) {
                i += 1;
                if terminators.contains(&c) {
                    return Ok((token, c));
                }
                token.push(c);
            }
            Err(malformed())
        };

        let (coord, mut sep) = read_token(&[':', ')'])?;
        if coord.is_empty() {
            return Err(malformed());
        }
        let mut parsed = Self {
            coord,
            element: None,
            custom: None,
            dummy: false,
        };
        while sep == ':' {
            let (token, end) = read_token(&[':', ')'])?;
            sep = end;
            if let Some(custom) = token.strip_prefix("custom=") {
                // the custom regex must be terminated by a colon
                if sep != ':' {
                    return Err(PregexError::UnterminatedCustom(parsed.coord));
                }
                parsed.custom = Some(custom.to_string());
            } else if token == "dummy" {
                parsed.dummy = true;
            } else if token.is_empty() {
                continue;
            } else if parsed.element.is_none() {
                parsed.element = Some(token);
            } else {
                return Err(malformed());
            }
        }
        Ok((parsed, i))
    }

    /// Resolve to an (element name, sub-pattern) pair.
    fn resolve(&self, registry: &ElementRegistry) -> Result<(String, String), PregexError> {
        if let Some(custom) = &self.custom {
            let name = self.element.clone().unwrap_or_else(|| "custom".to_string());
            return Ok((name, custom.clone()));
        }
        let name = self.element.clone().unwrap_or_else(|| "char".to_string());
        let pattern = registry.pattern_of(&name)?;
        Ok((name, pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_and_capture() {
        let pregex = Pregex::compile(r"SSH_%(time:x)\.nc").unwrap();
        assert_eq!(pregex.matchers().len(), 1);
        assert_eq!(pregex.matchers()[0].coord(), "time");
        assert_eq!(pregex.matchers()[0].element(), "x");
        assert_eq!(
            pregex.captures("SSH_20070101.nc").unwrap(),
            vec!["20070101".to_string()]
        );
        assert!(pregex.captures("SST_20070101.nc").is_none());
    }

    #[test]
    fn custom_and_dummy() {
        let pregex =
            Pregex::compile(r"%(depth:custom=\d{3}:)m/sst_%(time:Y)_%(run:idx:dummy)\.nc").unwrap();
        let caps = pregex.captures("150m/sst_2007_03.nc").unwrap();
        assert_eq!(caps, vec!["150", "2007", "03"]);
        assert!(pregex.matchers()[2].is_dummy());
        assert_eq!(pregex.matchers_of("time"), vec![1]);
    }

    #[test]
    fn percent_escape() {
        let pregex = Pregex::compile(r"load_%%_%(time:Y)\.nc").unwrap();
        assert!(pregex.is_match("load_%_2007.nc"));
    }

    #[test]
    fn fixed_matcher_is_literal() {
        let fixed = [("depth".to_string(), "150".to_string())].into();
        let pregex =
            Pregex::compile_with(r"%(depth:idx)m_%(time:Y)\.nc", &ElementRegistry::new(), &fixed)
                .unwrap();
        assert_eq!(pregex.matchers().len(), 1);
        assert_eq!(pregex.captures("150m_2007.nc").unwrap(), vec!["2007"]);
        assert!(!pregex.is_match("042m_2007.nc"));
    }

    #[test]
    fn adjacent_matchers_capture_positionally() {
        // Fixed-width elements keep adjacent captures unambiguous; the
        // compiler warns but still compiles.
        let pregex = Pregex::compile(r"sst_%(time:Y)%(time:mm)\.nc").unwrap();
        assert_eq!(pregex.matchers().len(), 2);
        assert_eq!(
            pregex.captures("sst_200701.nc").unwrap(),
            vec!["2007".to_string(), "01".to_string()]
        );
    }

    #[test]
    fn malformed_patterns() {
        assert!(matches!(
            Pregex::compile("%(time:Y"),
            Err(PregexError::Malformed { .. })
        ));
        assert!(matches!(
            Pregex::compile("a_%x"),
            Err(PregexError::Malformed { .. })
        ));
        assert!(matches!(
            Pregex::compile(r"%(time:custom=\d+)"),
            Err(PregexError::UnterminatedCustom(_))
        ));
        assert!(matches!(
            Pregex::compile("%(time:nope)"),
            Err(PregexError::UnknownElement(_))
        ));
    }

    #[test]
    fn segments_round_trip() {
        let pregex = Pregex::compile(r"%(d:idx)m/SSH_%(time:x)\.nc").unwrap();
        let segments = pregex.segments("150m/SSH_20070101.nc").unwrap();
        assert_eq!(segments.len(), 5);
        assert_eq!(segments[1], "150");
        assert_eq!(segments[3], "20070101");
        let rebuilt = pregex.reconstruct(&segments, &[(1, "20070109")]);
        assert_eq!(rebuilt, "150m/SSH_20070109.nc");
        assert_eq!(pregex.reconstruct(&segments, &[]), "150m/SSH_20070101.nc");
    }

    #[test]
    fn substituted_values_reextract() {
        let pregex = Pregex::compile(r"sst_%(time:Y)-%(time:mm)\.nc").unwrap();
        let segments = pregex.segments("sst_2007-01.nc").unwrap();
        let name = pregex.reconstruct(&segments, &[(0, "2012"), (1, "11")]);
        assert_eq!(pregex.captures(&name).unwrap(), vec!["2012", "11"]);
    }
}
