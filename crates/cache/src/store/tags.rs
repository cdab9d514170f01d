//! Inverted index from tag to the set of keys carrying it.

use std::collections::{HashMap, HashSet};

/// Tag -> keys index kept in step with the entry store.
///
/// A tag whose key set becomes empty is removed, so `tag_count` only reports
/// tags with at least one live association.
#[derive(Debug, Default)]
pub struct TagIndex {
    by_tag: HashMap<String, HashSet<String>>,
}

impl TagIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` carries each of `tags`.
    pub fn associate<'a, I>(&mut self, key: &str, tags: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for tag in tags {
            self.by_tag.entry(tag.clone()).or_default().insert(key.to_string());
        }
    }

    /// Drop the association between `key` and each of `tags`.
    pub fn disassociate<'a, I>(&mut self, key: &str, tags: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for tag in tags {
            if let Some(keys) = self.by_tag.get_mut(tag.as_str()) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag.as_str());
                }
            }
        }
    }

    /// Union of the keys carrying any of `tags`, unordered and deduplicated.
    pub fn keys_for_tags<I, S>(&self, tags: I) -> HashSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = HashSet::new();
        for tag in tags {
            if let Some(keys) = self.by_tag.get(tag.as_ref()) {
                out.extend(keys.iter().cloned());
            }
        }
        out
    }

    /// Whether `key` is listed under `tag`
    pub fn contains(&self, tag: &str, key: &str) -> bool {
        self.by_tag.get(tag).is_some_and(|keys| keys.contains(key))
    }

    /// Number of tags with at least one key
    pub fn tag_count(&self) -> usize {
        self.by_tag.len()
    }

    /// Iterate `(tag, key)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.by_tag
            .iter()
            .flat_map(|(tag, keys)| keys.iter().map(move |key| (tag.as_str(), key.as_str())))
    }

    /// Drop every association
    pub fn clear(&mut self) {
        self.by_tag.clear();
    }
}
