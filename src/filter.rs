//! Change filter for watch events
//!
//! Decides, from object metadata alone, whether a create/update/delete
//! notification should enqueue a reconciliation. The predicates are pure
//! functions of the change and the static configuration so they can be tested
//! without a live watch.
//!
//! The kube watcher only reports "applied" and "deleted". [`ChangeTracker`]
//! remembers the last snapshot of every object so an update can be evaluated
//! against the state the object had before the change.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;

use futures::{Stream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher;
use kube::Resource;

use crate::identity::{is_enabled, ObjectKey, StaticIdentity};
use crate::SERVICE_NAME_LABEL;

/// One classified notification
#[derive(Clone, Copy, Debug)]
pub enum Change<'a> {
    /// First sighting of an object
    Created(&'a ObjectMeta),
    /// An object seen before changed
    Updated {
        /// Snapshot before the change
        old: &'a ObjectMeta,
        /// Snapshot after the change
        new: &'a ObjectMeta,
    },
    /// The object is gone (last known snapshot)
    Deleted(&'a ObjectMeta),
}

impl<'a> Change<'a> {
    /// Metadata a source-side predicate is evaluated against
    ///
    /// Updates use the pre-change snapshot so an object that is relabeled away
    /// from the source still triggers one last reconciliation.
    pub fn subject(&self) -> &'a ObjectMeta {
        match self {
            Change::Created(meta) | Change::Deleted(meta) => meta,
            Change::Updated { old, .. } => old,
        }
    }
}

/// Source `EndpointSlice` of a slice, read from its service-name label
pub fn slice_owner(meta: &ObjectMeta) -> Option<ObjectKey> {
    let service = meta.labels.as_ref()?.get(SERVICE_NAME_LABEL)?;
    Some(ObjectKey::new(
        meta.namespace.clone().unwrap_or_default(),
        service.clone(),
    ))
}

/// Accept slices belonging to the static source Service
pub fn accept_source_slice(change: &Change<'_>, statics: &StaticIdentity) -> bool {
    slice_owner(change.subject()).is_some_and(|owner| owner == statics.source)
}

/// Accept the static source `Endpoints` record
pub fn accept_source_endpoints(change: &Change<'_>, statics: &StaticIdentity) -> bool {
    statics.source.matches(change.subject())
}

/// Accept the static managed object or any object opted in through annotations
///
/// Updates are accepted when either snapshot qualifies, so flipping the
/// enablement annotation in either direction is observed.
pub fn accept_managed(change: &Change<'_>, statics: &StaticIdentity) -> bool {
    let qualifies = |meta: &ObjectMeta| statics.managed.matches(meta) || is_enabled(meta);
    match change {
        Change::Created(meta) | Change::Deleted(meta) => qualifies(meta),
        Change::Updated { old, new } => qualifies(old) || qualifies(new),
    }
}

/// Accept triggers for the whole-object strategy
///
/// The trigger is either the static source record or an annotated managed record.
pub fn accept_endpoints_trigger(change: &Change<'_>, statics: &StaticIdentity) -> bool {
    accept_source_endpoints(change, statics)
        || match change {
            Change::Created(meta) | Change::Deleted(meta) => is_enabled(meta),
            Change::Updated { old, new } => is_enabled(old) || is_enabled(new),
        }
}

// =============================================================================
// Change tracking
// =============================================================================

/// Classifies watcher events into [`Change`]s using remembered snapshots
///
/// Only metadata is remembered; predicates never look past it.
pub struct ChangeTracker<K> {
    seen: HashMap<ObjectKey, ObjectMeta>,
    relisting: Option<HashSet<ObjectKey>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Default for ChangeTracker<K> {
    fn default() -> Self {
        Self {
            seen: HashMap::new(),
            relisting: None,
            _kind: PhantomData,
        }
    }
}

impl<K> ChangeTracker<K>
where
    K: Resource + Clone + Default,
{
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently remembered
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// True when nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Feed one watcher event, returning the objects whose change was accepted
    ///
    /// An accepted update yields the current object twice: once carrying the
    /// previous metadata, once as it is now. Downstream mappers then route the
    /// change to whatever the object pointed at before and after.
    ///
    /// A relist (`Init` .. `InitDone`) that no longer contains a remembered
    /// object reports it as deleted, since its delete event was missed.
    pub fn observe<F>(&mut self, event: watcher::Event<K>, accept: F) -> Vec<K>
    where
        F: Fn(&Change<'_>) -> bool,
    {
        match event {
            watcher::Event::Init => {
                self.relisting = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                let key = ObjectKey::from_meta(obj.meta());
                if let Some(listed) = self.relisting.as_mut() {
                    listed.insert(key);
                }
                self.apply(obj, &accept)
            }
            watcher::Event::Apply(obj) => self.apply(obj, &accept),
            watcher::Event::Delete(obj) => {
                let key = ObjectKey::from_meta(obj.meta());
                self.seen.remove(&key);
                if accept(&Change::Deleted(obj.meta())) {
                    vec![obj]
                } else {
                    Vec::new()
                }
            }
            watcher::Event::InitDone => {
                let Some(listed) = self.relisting.take() else {
                    return Vec::new();
                };
                let vanished: Vec<ObjectKey> = self
                    .seen
                    .keys()
                    .filter(|key| !listed.contains(*key))
                    .cloned()
                    .collect();
                vanished
                    .into_iter()
                    .filter_map(|key| self.seen.remove(&key))
                    .filter(|meta| accept(&Change::Deleted(meta)))
                    .map(|meta| with_meta(K::default(), meta))
                    .collect()
            }
        }
    }

    fn apply<F>(&mut self, obj: K, accept: &F) -> Vec<K>
    where
        F: Fn(&Change<'_>) -> bool,
    {
        let key = ObjectKey::from_meta(obj.meta());
        match self.seen.insert(key, snapshot(obj.meta())) {
            Some(old) => {
                let accepted = accept(&Change::Updated {
                    old: &old,
                    new: obj.meta(),
                });
                if accepted {
                    vec![with_meta(obj.clone(), old), obj]
                } else {
                    Vec::new()
                }
            }
            None if accept(&Change::Created(obj.meta())) => vec![obj],
            None => Vec::new(),
        }
    }
}

/// Metadata worth remembering; managed fields are large and never inspected
fn snapshot(meta: &ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        managed_fields: None,
        ..meta.clone()
    }
}

fn with_meta<K: Resource>(mut obj: K, meta: ObjectMeta) -> K {
    *obj.meta_mut() = meta;
    obj
}

/// Turn a raw watch stream into a stream of accepted objects
///
/// Watch errors pass through untouched so the controller can report them.
pub fn tracked<K, S, F>(stream: S, accept: F) -> impl Stream<Item = Result<K, watcher::Error>>
where
    K: Resource + Clone + Default + Send + 'static,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
    F: Fn(&Change<'_>) -> bool,
{
    let mut tracker = ChangeTracker::new();
    stream.flat_map(move |event| {
        let items: Vec<Result<K, watcher::Error>> = match event {
            Ok(event) => tracker.observe(event, &accept).into_iter().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        };
        futures::stream::iter(items)
    })
}
