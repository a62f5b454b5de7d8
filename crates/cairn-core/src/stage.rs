//! Stage partitioning for dependency-ordered apply
//!
//! A batch of manifests usually mixes kinds with hard ordering constraints:
//! a Namespace must admit its tenants, a CustomResourceDefinition must be
//! established before instances of it are sent. The partitioner groups a
//! batch into totally ordered stages; everything in stage N is committed
//! before stage N+1 starts.

use kube::api::DynamicObject;

use crate::object::{split_api_version, subject, ObjectId};

/// Dependency class of a resource kind. Lower classes apply first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ResourceClass {
    /// Namespace, CustomResourceDefinition - the kinds other objects live in
    Definition = 0,
    /// RBAC and configuration: ServiceAccount, (Cluster)Role/(Cluster)RoleBinding, ConfigMap, Secret
    Config = 1,
    /// Every other built-in kind
    Builtin = 2,
    /// Instances of CRDs applied in an earlier stage
    Custom = 3,
}

impl ResourceClass {
    /// Classify a resource by kind and apiVersion.
    pub fn of(kind: &str, api_version: &str) -> Self {
        match kind {
            "Namespace" | "CustomResourceDefinition" => Self::Definition,
            "ServiceAccount" | "Role" | "RoleBinding" | "ClusterRole" | "ClusterRoleBinding"
            | "ConfigMap" | "Secret" => Self::Config,
            _ => {
                if is_custom_api_version(api_version) {
                    Self::Custom
                } else {
                    Self::Builtin
                }
            }
        }
    }

    pub fn of_object(obj: &DynamicObject) -> Self {
        let id = ObjectId::from_object(obj);
        Self::of(&id.kind, &id.api_version)
    }
}

/// A custom API group is anything with a dot that is not part of the
/// `*.k8s.io` built-in family. `monitoring.coreos.com/v1` is custom,
/// `networking.k8s.io/v1` and bare `v1` are not.
pub fn is_custom_api_version(api_version: &str) -> bool {
    let (group, _) = split_api_version(api_version);
    group.contains('.') && group != "k8s.io" && !group.ends_with(".k8s.io")
}

/// One stage of an apply plan.
#[derive(Debug, Clone)]
pub struct Stage {
    pub class: ResourceClass,
    pub objects: Vec<DynamicObject>,
}

/// Partition a batch into ordered stages.
///
/// Empty classes are dropped. Within each stage, objects are sorted
/// lexicographically by subject so the resulting change set is
/// deterministic regardless of input order.
pub fn partition(objects: Vec<DynamicObject>) -> Vec<Stage> {
    let mut buckets: [Vec<DynamicObject>; 4] = Default::default();
    for obj in objects {
        let class = ResourceClass::of_object(&obj);
        buckets[class as usize].push(obj);
    }

    let classes = [
        ResourceClass::Definition,
        ResourceClass::Config,
        ResourceClass::Builtin,
        ResourceClass::Custom,
    ];

    classes
        .into_iter()
        .zip(buckets)
        .filter(|(_, objs)| !objs.is_empty())
        .map(|(class, mut objects)| {
            objects.sort_by_cached_key(|o| subject(o));
            Stage { class, objects }
        })
        .collect()
}
