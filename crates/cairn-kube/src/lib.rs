//! Cairn Kube - the server-side apply engine
//!
//! This crate provides:
//! - **Applier**: staged, diff-driven reconciliation of dynamic objects
//!   (`apply`, `apply_all`, `apply_all_staged`, `diff`)
//! - **Object stores**: the transport seam, with a kube-client
//!   implementation and an in-memory mock for tests
//! - **Diff engine**: field-aware drift detection with Secret masking
//! - **Forced re-creation**: delete + finalizer wait + re-apply for
//!   immutable-field changes
//! - **Cleanup**: removal of competing field managers and legacy metadata
//!
//! The engine is a library: it produces a [`ChangeSet`] and touches nothing
//! but the cluster handed to it.

pub mod apply;
mod cleanup;
pub mod diff;
pub mod error;
pub mod options;
pub mod store;

pub use apply::{Applier, Owner};
pub use error::{ApplyError, ErrorReason, Result};
pub use options::{ApplyOptions, CleanupOptions, FieldManagerSpec, FieldOperation};
pub use store::{
    ApplyParams, KubeStore, MockObjectStore, ObjectStore, OperationCounts, Propagation, StoreError,
};

// The object model this engine produces and consumes.
pub use cairn_core::{Action, ChangeSet, ChangeSetEntry, ObjectId, ResourceClass};
