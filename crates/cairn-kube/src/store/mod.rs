//! The object store seam between the engine and the cluster
//!
//! The engine never talks to a transport directly; it drives an
//! [`ObjectStore`], which classifies every failure into a small set of
//! reasons the planner can act on. Two implementations ship here: a
//! kube-client-backed [`KubeStore`] and an in-memory [`MockObjectStore`]
//! for tests.

mod kube;
mod mock;

pub use self::kube::KubeStore;
pub use self::mock::{MockObjectStore, OperationCounts};

use async_trait::async_trait;
use ::kube::api::DynamicObject;
use thiserror::Error;

use cairn_core::ObjectId;

use crate::error::{is_immutable_message, ErrorReason};

/// Transport-level failure, classified.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    /// Server-side validation rejected the object; the message is the
    /// server's own text
    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            StoreError::NotFound => ErrorReason::NotFound,
            StoreError::Conflict(_) => ErrorReason::Conflict,
            StoreError::Invalid(_) => ErrorReason::Invalid,
            StoreError::Forbidden(_) => ErrorReason::Forbidden,
            StoreError::Timeout(_) => ErrorReason::Timeout,
            StoreError::Other(_) => ErrorReason::Unknown,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    /// An `Invalid` rejection caused by an immutable field; the signal that
    /// makes an object eligible for forced re-creation.
    pub fn is_immutable(&self) -> bool {
        matches!(self, StoreError::Invalid(msg) if is_immutable_message(msg))
    }
}

/// Parameters for a server-side apply.
#[derive(Debug, Clone)]
pub struct ApplyParams {
    /// Field manager recorded as the owner of applied fields
    pub field_manager: String,
    /// Validate and project the merge without committing
    pub dry_run: bool,
    /// Take ownership of fields held by other managers
    pub force: bool,
}

impl ApplyParams {
    pub fn new(field_manager: impl Into<String>) -> Self {
        Self {
            field_manager: field_manager.into(),
            dry_run: false,
            force: true,
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Deletion propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Block deletion on dependents; the engine uses this for re-creation
    Foreground,
    Background,
    Orphan,
}

/// Minimal transport contract the engine needs from a cluster.
///
/// All write methods return the resulting object as the server sees it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the live object, or `StoreError::NotFound`.
    async fn get(&self, id: &ObjectId) -> Result<DynamicObject, StoreError>;

    /// Create the object, recording `field_manager` as its first owner.
    async fn create(
        &self,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, StoreError>;

    /// Replace the object with optimistic concurrency on `resourceVersion`.
    async fn update(
        &self,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, StoreError>;

    /// Server-side apply (or dry-run apply) of the desired object.
    async fn apply(
        &self,
        obj: &DynamicObject,
        params: &ApplyParams,
    ) -> Result<DynamicObject, StoreError>;

    /// Delete the object.
    async fn delete(&self, id: &ObjectId, propagation: Propagation) -> Result<(), StoreError>;
}
