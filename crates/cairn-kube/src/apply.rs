//! The apply planner/executor
//!
//! [`Applier`] drives a batch of desired objects toward their target state:
//! dry-run diff against the cluster, commit only real changes, re-create
//! objects whose diffs hit immutable fields (when permitted), then clean up
//! metadata left behind by competing tooling. Work is sequential and
//! deterministic: stages strictly in order, subject-sorted within a stage,
//! so re-running the same inputs yields the same change set.

use std::collections::BTreeMap;
use std::time::Duration;

use kube::api::DynamicObject;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cairn_core::{
    matches_selector, partition, subject, Action, ChangeSet, ChangeSetEntry, ObjectId,
};

use crate::cleanup;
use crate::diff;
use crate::error::{ApplyError, ErrorReason, Result};
use crate::options::ApplyOptions;
use crate::store::{ApplyParams, ObjectStore, Propagation};

/// Identity the engine writes under: the field manager recorded on applied
/// fields, and the annotation/label domain for the engine's markers.
#[derive(Debug, Clone)]
pub struct Owner {
    pub manager: String,
    pub group: String,
}

impl Owner {
    pub fn new(manager: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            manager: manager.into(),
            group: group.into(),
        }
    }
}

impl Default for Owner {
    fn default() -> Self {
        Self::new("cairn", "cairn.io")
    }
}

/// What the dry-run concluded for one object.
#[derive(Debug)]
enum Evaluation {
    /// Selector opt-out; leave the object alone
    Excluded,
    /// Present and under `IfNotPresent` policy
    IfNotPresent,
    Unchanged,
    Created,
    Configured { paths: Vec<String> },
    /// Dry-run hit an immutable field; re-creation required
    NeedsForce { message: String },
}

struct Plan {
    evaluation: Evaluation,
    live: Option<DynamicObject>,
    merged: Option<DynamicObject>,
}

/// The apply engine. Generic over the object store so tests can run against
/// an in-memory cluster.
pub struct Applier<S: ObjectStore> {
    store: S,
    owner: Owner,
    poll_interval: Duration,
    cancel: Option<CancellationToken>,
}

impl<S: ObjectStore> Applier<S> {
    pub fn new(store: S, owner: Owner) -> Self {
        Self {
            store,
            owner,
            poll_interval: Duration::from_secs(2),
            cancel: None,
        }
    }

    /// How often to probe for completed deletion during forced re-creation.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Cancel in-flight work when the token fires. Checked before every
    /// network round-trip and at every wait-loop sleep.
    pub fn cancelled_by(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Stamp the labels identifying the owning application on a set of
    /// objects. The engine never reads these back; they exist so callers can
    /// build selectors over them.
    pub fn set_owner_labels(&self, objects: &mut [DynamicObject], name: &str, namespace: &str) {
        for obj in objects {
            let labels = obj.metadata.labels.get_or_insert_with(BTreeMap::new);
            labels.insert(format!("{}/name", self.owner.group), name.to_string());
            labels.insert(
                format!("{}/namespace", self.owner.group),
                namespace.to_string(),
            );
        }
    }

    /// Reconcile a single object. Returns a change set with exactly one
    /// entry.
    pub async fn apply(&self, obj: &DynamicObject, opts: &ApplyOptions) -> Result<ChangeSet> {
        let mut change_set = ChangeSet::new();
        change_set.add(self.apply_one(obj, opts).await?);
        Ok(change_set)
    }

    /// Reconcile a batch in the caller's order, as one implicit stage.
    pub async fn apply_all(
        &self,
        objects: &[DynamicObject],
        opts: &ApplyOptions,
    ) -> Result<ChangeSet> {
        let mut change_set = ChangeSet::new();
        for obj in objects {
            change_set.add(self.apply_one(obj, opts).await?);
        }
        Ok(change_set)
    }

    /// Reconcile a batch in dependency order: definitions (Namespace, CRD)
    /// first, then RBAC and configuration, then remaining built-ins, then
    /// custom resources. Each stage is fully committed, cleanup included,
    /// before the next begins.
    pub async fn apply_all_staged(
        &self,
        objects: &[DynamicObject],
        opts: &ApplyOptions,
    ) -> Result<ChangeSet> {
        let mut change_set = ChangeSet::new();
        for stage in partition(objects.to_vec()) {
            debug!(class = ?stage.class, objects = stage.objects.len(), "applying stage");
            for obj in &stage.objects {
                change_set.add(self.apply_one(obj, opts).await?);
            }
        }
        Ok(change_set)
    }

    /// Dry-run a single object without committing anything. Returns the
    /// would-be change set entry along with the live and projected objects
    /// (absent when the object does not exist or was skipped), so callers
    /// can render a diff, e.g. via [`diff::render_text_diff`].
    pub async fn diff(
        &self,
        obj: &DynamicObject,
        opts: &ApplyOptions,
    ) -> Result<(ChangeSetEntry, Option<DynamicObject>, Option<DynamicObject>)> {
        let subject = subject(obj);
        let plan = self.evaluate(obj, opts).await?;
        let entry = self.entry_for(&subject, &plan.evaluation, obj);
        Ok((entry, plan.live, plan.merged))
    }

    async fn apply_one(&self, obj: &DynamicObject, opts: &ApplyOptions) -> Result<ChangeSetEntry> {
        let id = ObjectId::from_object(obj);
        let subject = id.subject();

        let plan = self.evaluate(obj, opts).await?;
        match plan.evaluation {
            Evaluation::Excluded => {
                debug!(subject = %subject, "excluded by selector");
                return Ok(ChangeSetEntry::new(subject, Action::Unchanged));
            }
            Evaluation::IfNotPresent => {
                debug!(subject = %subject, "already present, skipping");
                return Ok(ChangeSetEntry::new(subject, Action::Skipped));
            }
            Evaluation::Unchanged => {
                self.cleanup(&id, obj, opts).await?;
                return Ok(ChangeSetEntry::new(subject, Action::Unchanged));
            }
            Evaluation::Created => {
                self.commit(obj, &subject).await?;
                self.cleanup(&id, obj, opts).await?;
                debug!(subject = %subject, "created");
                Ok(ChangeSetEntry::new(subject, Action::Created))
            }
            Evaluation::Configured { paths } => {
                self.commit(obj, &subject).await?;
                self.cleanup(&id, obj, opts).await?;
                debug!(subject = %subject, changed = %paths.join(","), "configured");
                Ok(self.configured_entry(subject, obj, paths))
            }
            Evaluation::NeedsForce { message } => {
                let permitted = opts.force || matches_selector(&opts.force_selector, obj);
                if !permitted {
                    return Err(ApplyError::DryRun {
                        subject,
                        reason: ErrorReason::Invalid,
                        message,
                    });
                }
                warn!(subject = %subject, "immutable field rejected, re-creating");
                self.recreate(&id, obj, &subject).await?;
                self.cleanup(&id, obj, opts).await?;
                Ok(ChangeSetEntry::new(subject, Action::Created))
            }
        }
    }

    /// Classify one object without writing: selector checks, existence
    /// probe, server-side dry-run, drift comparison.
    async fn evaluate(&self, obj: &DynamicObject, opts: &ApplyOptions) -> Result<Plan> {
        let id = ObjectId::from_object(obj);

        let if_not_present = matches_selector(&opts.if_not_present_selector, obj)
            && !self.has_override_marker(obj);

        if !if_not_present && matches_selector(&opts.exclusion_selector, obj) {
            return Ok(Plan {
                evaluation: Evaluation::Excluded,
                live: None,
                merged: None,
            });
        }

        self.checkpoint()?;
        let live = match self.store.get(&id).await {
            Ok(o) => Some(o),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                return Err(ApplyError::Fetch {
                    subject: id.subject(),
                    reason: e.reason(),
                    message: e.to_string(),
                })
            }
        };

        if let Some(live_obj) = &live {
            if if_not_present {
                return Ok(Plan {
                    evaluation: Evaluation::IfNotPresent,
                    live,
                    merged: None,
                });
            }
            // An operator can freeze an object by annotating the live copy.
            if matches_selector(&opts.exclusion_selector, live_obj) {
                return Ok(Plan {
                    evaluation: Evaluation::Excluded,
                    live,
                    merged: None,
                });
            }
        }

        self.checkpoint()?;
        let params = ApplyParams::new(&self.owner.manager).dry_run();
        match self.store.apply(obj, &params).await {
            Ok(merged) => {
                let evaluation = match &live {
                    None => Evaluation::Created,
                    Some(live_obj) => {
                        if diff::has_drifted(live_obj, &merged) {
                            Evaluation::Configured {
                                paths: diff::changed_paths(live_obj, &merged),
                            }
                        } else {
                            Evaluation::Unchanged
                        }
                    }
                };
                Ok(Plan {
                    evaluation,
                    live,
                    merged: Some(merged),
                })
            }
            Err(e) if e.is_immutable() && live.is_some() => Ok(Plan {
                evaluation: Evaluation::NeedsForce {
                    message: e.to_string(),
                },
                live,
                merged: None,
            }),
            Err(e) => Err(ApplyError::DryRun {
                subject: id.subject(),
                reason: e.reason(),
                message: e.to_string(),
            }),
        }
    }

    /// Commit the desired state with a real server-side apply.
    async fn commit(&self, obj: &DynamicObject, subject: &str) -> Result<DynamicObject> {
        self.checkpoint()?;
        let params = ApplyParams::new(&self.owner.manager);
        self.store
            .apply(obj, &params)
            .await
            .map_err(|e| ApplyError::Apply {
                subject: subject.to_string(),
                reason: e.reason(),
                message: e.to_string(),
            })
    }

    /// Forced re-creation: foreground delete, wait out finalizers, apply
    /// anew. The wait has no internal timeout; it is bounded only by the
    /// caller's cancellation.
    async fn recreate(&self, id: &ObjectId, obj: &DynamicObject, subject: &str) -> Result<()> {
        self.checkpoint()?;
        match self.store.delete(id, Propagation::Foreground).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                return Err(ApplyError::Recreate {
                    subject: subject.to_string(),
                    reason: e.reason(),
                    message: e.to_string(),
                })
            }
        }

        loop {
            self.checkpoint()?;
            match self.store.get(id).await {
                Err(e) if e.is_not_found() => break,
                Ok(_) => {
                    debug!(subject = %subject, "waiting for deletion");
                }
                Err(e) => {
                    return Err(ApplyError::Recreate {
                        subject: subject.to_string(),
                        reason: e.reason(),
                        message: e.to_string(),
                    })
                }
            }
            self.sleep(self.poll_interval).await?;
        }

        let params = ApplyParams::new(&self.owner.manager);
        self.store
            .apply(obj, &params)
            .await
            .map_err(|e| ApplyError::Recreate {
                subject: subject.to_string(),
                reason: e.reason(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn cleanup(&self, id: &ObjectId, obj: &DynamicObject, opts: &ApplyOptions) -> Result<()> {
        if opts.cleanup.is_empty() || matches_selector(&opts.cleanup.exclusions, obj) {
            return Ok(());
        }
        self.checkpoint()?;
        cleanup::run(&self.store, &self.owner, id, &opts.cleanup).await
    }

    fn entry_for(&self, subject: &str, evaluation: &Evaluation, obj: &DynamicObject) -> ChangeSetEntry {
        match evaluation {
            Evaluation::Excluded | Evaluation::Unchanged => {
                ChangeSetEntry::new(subject, Action::Unchanged)
            }
            Evaluation::IfNotPresent => ChangeSetEntry::new(subject, Action::Skipped),
            Evaluation::Created | Evaluation::NeedsForce { .. } => {
                ChangeSetEntry::new(subject, Action::Created)
            }
            Evaluation::Configured { paths } => {
                self.configured_entry(subject.to_string(), obj, paths.clone())
            }
        }
    }

    fn configured_entry(
        &self,
        subject: String,
        obj: &DynamicObject,
        paths: Vec<String>,
    ) -> ChangeSetEntry {
        let entry = ChangeSetEntry::new(subject, Action::Configured);
        // Secrets get no diff summary at all.
        if diff::is_secret(obj) || paths.is_empty() {
            entry
        } else {
            entry.with_diff(paths.join(", "))
        }
    }

    fn has_override_marker(&self, obj: &DynamicObject) -> bool {
        obj.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&format!("{}/ssa", self.owner.group)))
            .map(|v| v == "Override")
            .unwrap_or(false)
    }

    fn checkpoint(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(ApplyError::Cancelled),
            _ => Ok(()),
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<()> {
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => Err(ApplyError::Cancelled),
                    _ = tokio::time::sleep(duration) => Ok(()),
                }
            }
            None => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }
}
