//! Matcher element registry.

use std::collections::HashMap;

use super::PregexError;

/// A registered element: either a sub-pattern, or a composite made of other
/// elements whose patterns are concatenated.
#[derive(Clone, Debug)]
enum ElementDef {
    Pattern(String),
    Composite(Vec<String>),
}

/// Maps element names to the sub-regex a matcher of that element compiles to.
///
/// Populated with the built-in elements at construction; callers may register
/// additional elements or override built-ins before compiling patterns.
#[derive(Clone, Debug)]
pub struct ElementRegistry {
    elements: HashMap<String, ElementDef>,
}

impl Default for ElementRegistry {
    fn default() -> Self {
        let mut registry = Self {
            elements: HashMap::new(),
        };
        registry.register("idx", r"\d*");
        registry.register("Y", r"\d{4}");
        registry.register("yy", r"\d\d");
        registry.register("mm", r"\d\d?");
        registry.register("dd", r"\d\d?");
        registry.register("doy", r"\d{1,3}");
        registry.register("M", r"[a-zA-Z]*");
        registry.register("text", r"[a-zA-Z]*");
        registry.register("char", r"\S*");
        // a full date, captured as one matcher
        registry.register_composite("x", &["Y", "mm", "dd"]);
        registry
    }
}

impl ElementRegistry {
    /// A registry with the built-in elements.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or override) an element with an explicit sub-pattern.
    pub fn register(&mut self, name: impl Into<String>, pattern: impl Into<String>) {
        self.elements
            .insert(name.into(), ElementDef::Pattern(pattern.into()));
    }

    /// Register a composite element expanding to other elements in order.
    ///
    /// The composite still compiles to a single capture group.
    pub fn register_composite(&mut self, name: impl Into<String>, parts: &[&str]) {
        self.elements.insert(
            name.into(),
            ElementDef::Composite(parts.iter().map(|&p| p.to_string()).collect()),
        );
    }

    /// Whether `name` is a registered element.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.elements.contains_key(name)
    }

    /// The sub-pattern `name` compiles to, with composites expanded.
    ///
    /// # Errors
    /// Returns [`PregexError::UnknownElement`] for unregistered names,
    /// including within a composite.
    pub fn pattern_of(&self, name: &str) -> Result<String, PregexError> {
        match self.elements.get(name) {
            None => Err(PregexError::UnknownElement(name.to_string())),
            Some(ElementDef::Pattern(p)) => Ok(p.clone()),
            Some(ElementDef::Composite(parts)) => {
                let mut pattern = String::new();
                for part in parts {
                    pattern.push_str(&self.pattern_of(part)?);
                }
                Ok(pattern)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_elements() {
        let registry = ElementRegistry::new();
        assert_eq!(registry.pattern_of("Y").unwrap(), r"\d{4}");
        assert_eq!(registry.pattern_of("x").unwrap(), r"\d{4}\d\d?\d\d?");
        assert!(registry.pattern_of("unknown").is_err());
    }

    #[test]
    fn user_registration() {
        let mut registry = ElementRegistry::new();
        registry.register("depth", r"\d{3}m");
        registry.register_composite("Ym", &["Y", "mm"]);
        assert_eq!(registry.pattern_of("depth").unwrap(), r"\d{3}m");
        assert_eq!(registry.pattern_of("Ym").unwrap(), r"\d{4}\d\d?");
    }
}
