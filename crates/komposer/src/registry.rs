//! The ordered resource registry built up during accumulation.
use indexmap::IndexMap;
use snafu::{Snafu, ensure};

use crate::{
    document::{self, Document},
    resid::{ResourceId, Selector},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("may not add resource with an already registered id: {id}"))]
    AlreadyRegistered { id: ResourceId },
}

/// An insertion-ordered map from [`ResourceId`] to [`Document`].
///
/// Insertion order is significant, it is the output order. Ids are unique at
/// all times: any append that would introduce a duplicate fails instead of
/// overwriting or merging, and leaves the registry untouched.
///
/// A registry exclusively owns its documents. Patches borrow one document at
/// a time via [`Registry::find_mut`] or [`Registry::select_mut`].
#[derive(Debug, Default)]
pub struct Registry {
    entries: IndexMap<ResourceId, Document>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a resource at the end of the registry.
    pub fn append(&mut self, id: ResourceId, document: Document) -> Result<()> {
        ensure!(
            !self.entries.contains_key(&id),
            AlreadyRegisteredSnafu { id }
        );
        self.entries.insert(id, document);
        Ok(())
    }

    /// Appends every entry of `other` in order. The first duplicate id in
    /// traversal order aborts the merge and is reported; no attempt is made
    /// to continue past a conflict.
    pub fn merge_append(&mut self, other: Self) -> Result<()> {
        for (id, document) in other.entries {
            self.append(id, document)?;
        }
        Ok(())
    }

    pub fn find(&self, id: &ResourceId) -> Option<&Document> {
        self.entries.get(id)
    }

    pub fn find_mut(&mut self, id: &ResourceId) -> Option<&mut Document> {
        self.entries.get_mut(id)
    }

    /// All entries matching `selector`, in registry order.
    pub fn select(&self, selector: &Selector) -> Vec<(&ResourceId, &Document)> {
        self.entries
            .iter()
            .filter(|(id, _)| selector.matches(id))
            .collect()
    }

    /// Mutable variant of [`Registry::select`].
    pub fn select_mut(&mut self, selector: &Selector) -> Vec<(&ResourceId, &mut Document)> {
        self.entries
            .iter_mut()
            .filter(|(id, _)| selector.matches(id))
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, &Document)> {
        self.entries.iter()
    }

    /// Serializes all documents in registry order as one YAML stream of
    /// explicit (`---`-prefixed) documents.
    pub fn to_yaml(&self) -> Result<String, document::Error> {
        let mut output = String::new();
        for document in self.entries.values() {
            output.push_str("---\n");
            output.push_str(&document.to_yaml()?);
        }
        Ok(output)
    }
}

impl IntoIterator for Registry {
    type Item = (ResourceId, Document);
    type IntoIter = indexmap::map::IntoIter<ResourceId, Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
