//! Apply configuration

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-call configuration for the apply engine.
///
/// The default options apply everything as-is: no forced re-creation, no
/// selector opt-outs, no metadata cleanup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyOptions {
    /// Re-create any object whose server-side apply is rejected on an
    /// immutable field, instead of surfacing the error
    pub force: bool,

    /// Per-object force opt-in: objects matching this annotation/label
    /// selector are re-created on immutable-field rejections even when
    /// `force` is false
    pub force_selector: BTreeMap<String, String>,

    /// Objects matching this selector (in desired or in-cluster state) are
    /// reported `Unchanged` and left alone
    pub exclusion_selector: BTreeMap<String, String>,

    /// Objects matching this selector are only applied on creation;
    /// subsequent applies report `Skipped`. An object overrides this by
    /// carrying the `<group>/ssa: Override` annotation.
    pub if_not_present_selector: BTreeMap<String, String>,

    /// Metadata cleanup performed after each successful apply
    pub cleanup: CleanupOptions,
}

/// What to strip from in-cluster objects after apply. Used to migrate
/// ownership away from prior tooling (client-side apply, kubectl).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupOptions {
    /// Annotation keys to remove
    pub annotations: Vec<String>,

    /// Label keys to remove
    pub labels: Vec<String>,

    /// Managed-field entries to drop, so their fields migrate to the engine
    pub field_managers: Vec<FieldManagerSpec>,

    /// Objects matching this selector are exempt from cleanup
    pub exclusions: BTreeMap<String, String>,
}

impl CleanupOptions {
    /// True when cleanup has nothing to do and can be skipped without a read.
    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty() && self.labels.is_empty() && self.field_managers.is_empty()
    }
}

/// A `(manager, operation)` pair identifying managed-field entries to drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldManagerSpec {
    pub name: String,
    pub operation: FieldOperation,
}

impl FieldManagerSpec {
    pub fn new(name: impl Into<String>, operation: FieldOperation) -> Self {
        Self {
            name: name.into(),
            operation,
        }
    }
}

/// The operation recorded in a managed-field entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldOperation {
    Apply,
    Update,
}

impl FieldOperation {
    /// The string the server records in `managedFields[].operation`.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldOperation::Apply => "Apply",
            FieldOperation::Update => "Update",
        }
    }
}
