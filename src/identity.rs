//! Identity resolution for a reconciliation
//!
//! Every reconciliation works on a (source, managed) pair. The pair is either
//! static (fixed at startup) or dynamic (declared on the managed object through
//! annotations). Exactly one mode applies, decided by the enablement annotation
//! on the triggering object.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::Resource;

use crate::{ENABLED_ANNOTATION, SOURCE_NAMESPACE_ANNOTATION, SOURCE_NAME_ANNOTATION};

/// Namespaced name of a cluster object
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Create a key from a namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of the object described by `meta` (missing fields become empty)
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    /// True when either half is missing; such a key can never be found
    pub fn is_empty(&self) -> bool {
        self.namespace.is_empty() || self.name.is_empty()
    }

    /// True when `meta` names this object
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        meta.namespace.as_deref() == Some(self.namespace.as_str())
            && meta.name.as_deref() == Some(self.name.as_str())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Source and managed identities supplied at startup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticIdentity {
    /// The authoritative ("default") Service
    pub source: ObjectKey,
    /// The Service alias kept in sync
    pub managed: ObjectKey,
}

/// How a pair was resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionMode {
    /// Both identities come from process configuration
    Static,
    /// The trigger is the managed object; the source comes from its annotations
    Dynamic,
}

/// The (source, managed) pair for one reconciliation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePair {
    /// Where endpoints are copied from
    pub source: ObjectKey,
    /// Where endpoints are copied to
    pub managed: ObjectKey,
    /// Which resolution applied
    pub mode: ResolutionMode,
}

/// True when the object carries `enabled: "true"`
///
/// Any other value, including `"True"` or `"1"`, means static mode.
pub fn is_enabled(meta: &ObjectMeta) -> bool {
    annotation(meta, ENABLED_ANNOTATION) == Some("true")
}

fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Source named by a dynamic object's annotations
///
/// Missing annotations yield empty fields rather than an error; the empty key
/// surfaces as not-found downstream.
pub fn annotated_source(meta: &ObjectMeta) -> ObjectKey {
    ObjectKey {
        namespace: annotation(meta, SOURCE_NAMESPACE_ANNOTATION)
            .unwrap_or_default()
            .to_string(),
        name: annotation(meta, SOURCE_NAME_ANNOTATION)
            .unwrap_or_default()
            .to_string(),
    }
}

/// Resolve the pair for a triggering object
pub fn resolve(trigger: &ObjectMeta, statics: &StaticIdentity) -> ServicePair {
    if is_enabled(trigger) {
        ServicePair {
            source: annotated_source(trigger),
            managed: ObjectKey::from_meta(trigger),
            mode: ResolutionMode::Dynamic,
        }
    } else {
        ServicePair {
            source: statics.source.clone(),
            managed: statics.managed.clone(),
            mode: ResolutionMode::Static,
        }
    }
}

/// Source → dynamic dependents lookup, maintained from a watch stream
///
/// Lets a source change be routed to every annotated alias that copies from it
/// without scanning all cached objects on each event.
#[derive(Clone, Default)]
pub struct DependentIndex {
    inner: Arc<RwLock<IndexState>>,
}

#[derive(Default)]
struct IndexState {
    by_source: HashMap<ObjectKey, BTreeSet<ObjectKey>>,
    source_of: HashMap<ObjectKey, ObjectKey>,
    relisting: Option<HashSet<ObjectKey>>,
}

impl IndexState {
    fn upsert(&mut self, meta: &ObjectMeta) {
        let key = ObjectKey::from_meta(meta);
        self.remove(&key);
        let source = annotated_source(meta);
        if is_enabled(meta) && !source.is_empty() {
            self.by_source.entry(source.clone()).or_default().insert(key.clone());
            self.source_of.insert(key, source);
        }
    }

    fn remove(&mut self, key: &ObjectKey) {
        let Some(source) = self.source_of.remove(key) else {
            return;
        };
        if let Some(dependents) = self.by_source.get_mut(&source) {
            dependents.remove(key);
            if dependents.is_empty() {
                self.by_source.remove(&source);
            }
        }
    }
}

impl DependentIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Update the index from one watcher event
    ///
    /// Objects missing from a completed relist are dropped.
    pub fn apply_event<K: Resource>(&self, event: &watcher::Event<K>) {
        let mut state = self.write();
        match event {
            watcher::Event::Apply(obj) => state.upsert(obj.meta()),
            watcher::Event::Delete(obj) => state.remove(&ObjectKey::from_meta(obj.meta())),
            watcher::Event::Init => state.relisting = Some(HashSet::new()),
            watcher::Event::InitApply(obj) => {
                if let Some(listed) = state.relisting.as_mut() {
                    listed.insert(ObjectKey::from_meta(obj.meta()));
                }
                state.upsert(obj.meta());
            }
            watcher::Event::InitDone => {
                let Some(listed) = state.relisting.take() else {
                    return;
                };
                let vanished: Vec<ObjectKey> = state
                    .source_of
                    .keys()
                    .filter(|key| !listed.contains(*key))
                    .cloned()
                    .collect();
                for key in &vanished {
                    state.remove(key);
                }
            }
        }
    }

    /// True when at least one annotated object names `source`
    pub fn has_dependents(&self, source: &ObjectKey) -> bool {
        self.read().by_source.contains_key(source)
    }

    /// References to every annotated object naming `source`
    pub fn dependents<K>(&self, source: &ObjectKey) -> Vec<ObjectRef<K>>
    where
        K: Resource<DynamicType = ()>,
    {
        self.read()
            .by_source
            .get(source)
            .map(|keys| {
                keys.iter()
                    .map(|key| ObjectRef::new(&key.name).within(&key.namespace))
                    .collect()
            })
            .unwrap_or_default()
    }
}
