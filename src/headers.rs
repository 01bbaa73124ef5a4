//! Ordered header map with case-insensitive lookup.
//!
//! AMI and AGI frames are built from `Key: Value` lines whose names are
//! case-insensitive on lookup but keep their original case and order on
//! emission, and may repeat. Backed by an insertion-ordered vector plus
//! a case-folded first-occurrence index.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Ordered `(name, value)` header pairs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<(String, String)>", into = "Vec<(String, String)>")]
pub struct Headers {
    entries: Vec<(String, String)>,
    // Lowercased name -> index of the first occurrence.
    index: HashMap<String, usize>,
}

impl Headers {
    /// Empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of header lines, duplicates included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when no headers are present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a header, preserving order and duplicates.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let folded = name.to_ascii_lowercase();
        self.entries.push((name, value.into()));
        self.index.entry(folded).or_insert(self.entries.len() - 1);
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.index
            .get(&name.to_ascii_lowercase())
            .map(|&i| self.entries[i].1.as_str())
    }

    /// Every value for `name`, in wire order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// `true` when at least one occurrence of `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_ascii_lowercase())
    }

    /// Iterate pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Append every pair of `other`, after the existing entries.
    ///
    /// Used when a list terminator's headers are folded into the
    /// response headers.
    pub fn merge(&mut self, other: &Headers) {
        for (name, value) in other.iter() {
            self.push(name, value);
        }
    }
}

impl PartialEq for Headers {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for Headers {}

impl From<Vec<(String, String)>> for Headers {
    fn from(pairs: Vec<(String, String)>) -> Self {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.push(name, value);
        }
        headers
    }
}

impl From<Headers> for Vec<(String, String)> {
    fn from(headers: Headers) -> Self {
        headers.entries
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.push(name, value);
        }
        headers
    }
}
