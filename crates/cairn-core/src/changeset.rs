//! Change sets: the per-object outcome report of an apply call

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What the engine did (or decided not to do) for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// The object did not exist, or was re-created during this call
    Created,
    /// A non-empty patch was committed
    Configured,
    /// The server-side dry-run showed no drift; nothing was written
    Unchanged,
    /// A selector opted the object out of this apply
    Skipped,
    /// No decision was reached (internal default)
    Unknown,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Created => "created",
            Action::Configured => "configured",
            Action::Unchanged => "unchanged",
            Action::Skipped => "skipped",
            Action::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Outcome for a single object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSetEntry {
    /// Canonical `Kind/namespace/name` identifier
    pub subject: String,
    pub action: Action,
    /// Changed top-level paths for `Configured` entries, when known.
    /// Omitted for Secrets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

impl ChangeSetEntry {
    pub fn new(subject: impl Into<String>, action: Action) -> Self {
        Self {
            subject: subject.into(),
            action,
            diff: None,
        }
    }

    pub fn with_diff(mut self, diff: impl Into<String>) -> Self {
        self.diff = Some(diff.into());
        self
    }
}

impl std::fmt::Display for ChangeSetEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.subject, self.action)
    }
}

/// Ordered collection of apply outcomes, one entry per input object.
///
/// Entries appear in the order the objects were processed: stage by stage,
/// subject-sorted within each stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub entries: Vec<ChangeSetEntry>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: ChangeSetEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, other: ChangeSet) {
        self.entries.extend(other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Subject -> action lookup.
    pub fn to_map(&self) -> BTreeMap<String, Action> {
        self.entries
            .iter()
            .map(|e| (e.subject.clone(), e.action))
            .collect()
    }
}

impl std::fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}
