//! Post-apply metadata cleanup
//!
//! After an object is in its desired state, the engine strips legacy
//! annotations and labels and drops managed-field entries left behind by
//! competing tooling, so their fields can be adopted on the next apply.
//! Commits use optimistic concurrency on `resourceVersion` with a small
//! bounded retry.

use kube::api::DynamicObject;
use tracing::{debug, warn};

use cairn_core::ObjectId;

use crate::apply::Owner;
use crate::error::{ApplyError, Result};
use crate::options::CleanupOptions;
use crate::store::ObjectStore;

const MAX_ATTEMPTS: u32 = 3;

pub(crate) async fn run<S: ObjectStore>(
    store: &S,
    owner: &Owner,
    id: &ObjectId,
    opts: &CleanupOptions,
) -> Result<()> {
    let mut last_conflict = String::new();

    for attempt in 1..=MAX_ATTEMPTS {
        let live = match store.get(id).await {
            Ok(obj) => obj,
            // Nothing left to clean.
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => {
                return Err(ApplyError::Cleanup {
                    subject: id.subject(),
                    attempts: attempt,
                    message: e.to_string(),
                })
            }
        };

        let Some(cleaned) = strip(&live, owner, opts) else {
            return Ok(());
        };

        match store.update(&cleaned, &owner.manager).await {
            Ok(_) => {
                debug!(subject = %id.subject(), "cleaned up metadata");
                return Ok(());
            }
            Err(e) if e.is_conflict() => {
                warn!(subject = %id.subject(), attempt, "cleanup update conflicted, retrying");
                last_conflict = e.to_string();
            }
            Err(e) => {
                return Err(ApplyError::Cleanup {
                    subject: id.subject(),
                    attempts: attempt,
                    message: e.to_string(),
                })
            }
        }
    }

    Err(ApplyError::Cleanup {
        subject: id.subject(),
        attempts: MAX_ATTEMPTS,
        message: last_conflict,
    })
}

/// Apply the cleanup config to a copy of the live object. Returns `None`
/// when nothing changed and no write is needed.
fn strip(live: &DynamicObject, owner: &Owner, opts: &CleanupOptions) -> Option<DynamicObject> {
    let mut obj = live.clone();
    let mut changed = false;

    if let Some(annotations) = obj.metadata.annotations.as_mut() {
        for key in &opts.annotations {
            changed |= annotations.remove(key).is_some();
        }
    }

    if let Some(labels) = obj.metadata.labels.as_mut() {
        for key in &opts.labels {
            changed |= labels.remove(key).is_some();
        }
    }

    if let Some(entries) = obj.metadata.managed_fields.as_mut() {
        let before = entries.len();
        entries.retain(|entry| {
            let manager = entry.manager.as_deref().unwrap_or_default();
            // The engine's own entries are never dropped.
            if manager == owner.manager {
                return true;
            }
            let operation = entry.operation.as_deref().unwrap_or_default();
            !opts
                .field_managers
                .iter()
                .any(|fm| fm.name == manager && fm.operation.as_str() == operation)
        });
        changed |= entries.len() != before;
    }

    changed.then_some(obj)
}
