//! Named collections of keys.

use std::fmt::{Display, Formatter};

use itertools::Itertools;

use super::{Key, KeyError, KeyShape};

/// One [`Key`] per dimension, in a definite dimension order.
///
/// The order of entries is the order of the dimensions in memory. Dimensions
/// absent from a keyring are treated as fully selected by operations that
/// take a dimension list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Keyring {
    keys: Vec<(String, Key)>,
}

impl Display for Keyring {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}]",
            self.keys
                .iter()
                .map(|(dim, key)| format!("{dim}: {key}"))
                .join(", ")
        )
    }
}

impl<S: Into<String>, K: Into<Key>> FromIterator<(S, K)> for Keyring {
    fn from_iter<T: IntoIterator<Item = (S, K)>>(iter: T) -> Self {
        let mut keyring = Self::new();
        for (dim, key) in iter {
            keyring.set(dim, key.into());
        }
        keyring
    }
}

impl Keyring {
    /// An empty keyring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dimensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the keyring has no dimension.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The dimension names, in order.
    #[must_use]
    pub fn dims(&self) -> Vec<&str> {
        self.keys.iter().map(|(dim, _)| dim.as_str()).collect()
    }

    /// Iterate over `(dimension, key)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Key)> {
        self.keys.iter().map(|(dim, key)| (dim.as_str(), key))
    }

    /// Iterate mutably over `(dimension, key)` pairs in order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Key)> {
        self.keys.iter_mut().map(|(dim, key)| (dim.as_str(), key))
    }

    /// The key for `dim`, if present.
    #[must_use]
    pub fn get(&self, dim: &str) -> Option<&Key> {
        self.keys
            .iter()
            .find(|(name, _)| name == dim)
            .map(|(_, key)| key)
    }

    /// Mutable access to the key for `dim`, if present.
    pub fn get_mut(&mut self, dim: &str) -> Option<&mut Key> {
        self.keys
            .iter_mut()
            .find(|(name, _)| name == dim)
            .map(|(_, key)| key)
    }

    /// Set the key for `dim`, appending the dimension if new.
    pub fn set(&mut self, dim: impl Into<String>, key: Key) {
        let dim = dim.into();
        match self.get_mut(&dim) {
            Some(slot) => *slot = key,
            None => self.keys.push((dim, key)),
        }
    }

    /// Remove and return the key for `dim`.
    pub fn remove(&mut self, dim: &str) -> Option<Key> {
        let pos = self.keys.iter().position(|(name, _)| name == dim)?;
        Some(self.keys.remove(pos).1)
    }

    /// Ensure every dimension in `dims` has a key, adding full-axis keys for
    /// the missing ones.
    pub fn make_full(&mut self, dims: &[&str]) {
        for dim in dims {
            if self.get(dim).is_none() {
                self.set(*dim, Key::all());
            }
        }
    }

    /// Reorder dimensions to follow `order`.
    ///
    /// Dimensions absent from `order` keep their relative order at the end.
    pub fn sort_by(&mut self, order: &[&str]) {
        self.keys.sort_by_key(|(dim, _)| {
            order
                .iter()
                .position(|o| o == dim)
                .unwrap_or(usize::MAX)
        });
    }

    /// The shape of the selection, skipping scalar (squeezed) dimensions.
    ///
    /// Returns [`None`] when any non-scalar key's length is undecided.
    #[must_use]
    pub fn shape(&self) -> Option<Vec<usize>> {
        self.keys
            .iter()
            .filter_map(|(_, key)| match key.shape() {
                KeyShape::Scalar => None,
                KeyShape::Len(n) => Some(Some(n)),
                KeyShape::Undecided => Some(None),
            })
            .collect()
    }

    /// Record parent sizes from a map of dimension sizes.
    pub fn set_parent_sizes<'a>(&mut self, sizes: impl Fn(&str) -> Option<usize> + 'a) {
        for (dim, key) in &mut self.keys {
            if let Some(size) = sizes(dim) {
                key.set_parent_size(size);
            }
        }
    }

    /// Restrict this keyring by another expressed in its index space.
    ///
    /// Dimension by dimension [`Key::compose`]; dimensions missing from
    /// `other` are kept as is.
    ///
    /// # Errors
    /// Forwards [`Key::compose`] errors.
    pub fn compose(&self, other: &Self) -> Result<Self, KeyError> {
        let mut out = Self::new();
        for (dim, key) in self.iter() {
            let composed = match other.get(dim) {
                Some(inner) => key.compose(inner)?,
                None => key.clone(),
            };
            out.set(dim, composed);
        }
        Ok(out)
    }

    /// Simplify every index-list key with a constant stride into a slice.
    pub fn simplify(&mut self) {
        for (_, key) in &mut self.keys {
            key.simplify();
        }
    }

    /// A copy with all scalar keys promoted to one-element lists.
    #[must_use]
    pub fn promote(&self) -> Self {
        self.iter()
            .map(|(dim, key)| (dim, key.promote()))
            .collect()
    }

    /// Whether any key is an explicit index list.
    ///
    /// List keys preclude direct (single-view) array access.
    #[must_use]
    pub fn has_list_key(&self) -> bool {
        self.keys
            .iter()
            .any(|(_, key)| matches!(key.value(), super::KeyValue::Indices(_) | super::KeyValue::Names(_)))
    }
}
