//! Business-synonym allow-list.
//!
//! Terms accepted as valid even though they are not literal schema columns,
//! because they denote recognized business vocabulary the fixer or downstream
//! layers resolve themselves. The list is an explicit, auditable mechanism
//! for suppressing known false positives: every term carries a note saying
//! why it is here, and nothing is added implicitly.

use crate::knowledge::normalize_identifier;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct BusinessSynonyms {
    terms: BTreeMap<String, String>,
}

impl BusinessSynonyms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, S, N>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, N)>,
        S: Into<String>,
        N: Into<String>,
    {
        let mut synonyms = Self::new();
        for (term, note) in entries {
            synonyms.add(term.into(), note.into());
        }
        synonyms
    }

    /// Register a term with its audit note.
    pub fn add(&mut self, term: impl AsRef<str>, note: impl Into<String>) {
        self.terms
            .insert(normalize_identifier(term.as_ref()), note.into());
    }

    pub fn contains(&self, term: &str) -> bool {
        self.terms.contains_key(&normalize_identifier(term))
    }

    /// The full allow-list with notes, for auditing.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.terms.iter().map(|(t, n)| (t.as_str(), n.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}
