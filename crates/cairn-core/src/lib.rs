//! Cairn Core - object model for the cairn apply engine
//!
//! This crate holds the pure, transport-free pieces of cairn:
//! - **Object identity**: canonical `Kind/namespace/name` subjects and GVK helpers
//! - **Selector matching**: annotation/label subset predicates
//! - **Stage partitioning**: dependency-ordered grouping of a manifest batch
//! - **Change sets**: per-object apply outcomes with deterministic ordering

pub mod changeset;
pub mod object;
pub mod selector;
pub mod stage;

pub use changeset::{Action, ChangeSet, ChangeSetEntry};
pub use object::{gvk_of, sort_objects, subject, ObjectId};
pub use selector::matches_selector;
pub use stage::{partition, ResourceClass, Stage};
