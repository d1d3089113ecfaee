//! kieop core types: the closed set of resource kinds the controller handles,
//! kind-tagged resources, ownership indexing and the `KieApp` custom resource.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{ApiResource, DynamicObject};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as Json;

pub mod app;
pub mod openshift;
pub mod status;

pub use app::{KieApp, KieAppSpec, KieAppStatus};

/// Every kind of object the controller reads or writes.
///
/// The first eleven variants are the kinds an instance can own and that the
/// inventory lists; the rest are auxiliary objects probed or written by
/// individual components.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    PersistentVolumeClaim,
    ServiceAccount,
    Secret,
    Role,
    RoleBinding,
    DeploymentConfig,
    Service,
    StatefulSet,
    Route,
    ImageStream,
    BuildConfig,
    ConfigMap,
    ImageStreamTag,
    Deployment,
    KieApp,
}

impl Kind {
    /// Kinds that carry an owner reference back to the instance and take part in diffing.
    pub const OWNED: [Kind; 11] = [
        Kind::PersistentVolumeClaim,
        Kind::ServiceAccount,
        Kind::Secret,
        Kind::Role,
        Kind::RoleBinding,
        Kind::DeploymentConfig,
        Kind::Service,
        Kind::StatefulSet,
        Kind::Route,
        Kind::ImageStream,
        Kind::BuildConfig,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::PersistentVolumeClaim => "PersistentVolumeClaim",
            Kind::ServiceAccount => "ServiceAccount",
            Kind::Secret => "Secret",
            Kind::Role => "Role",
            Kind::RoleBinding => "RoleBinding",
            Kind::DeploymentConfig => "DeploymentConfig",
            Kind::Service => "Service",
            Kind::StatefulSet => "StatefulSet",
            Kind::Route => "Route",
            Kind::ImageStream => "ImageStream",
            Kind::BuildConfig => "BuildConfig",
            Kind::ConfigMap => "ConfigMap",
            Kind::ImageStreamTag => "ImageStreamTag",
            Kind::Deployment => "Deployment",
            Kind::KieApp => "KieApp",
        }
    }

    /// `(group, version, plural)`
    fn coordinates(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            Kind::PersistentVolumeClaim => ("", "v1", "persistentvolumeclaims"),
            Kind::ServiceAccount => ("", "v1", "serviceaccounts"),
            Kind::Secret => ("", "v1", "secrets"),
            Kind::Role => ("rbac.authorization.k8s.io", "v1", "roles"),
            Kind::RoleBinding => ("rbac.authorization.k8s.io", "v1", "rolebindings"),
            Kind::DeploymentConfig => ("apps.openshift.io", "v1", "deploymentconfigs"),
            Kind::Service => ("", "v1", "services"),
            Kind::StatefulSet => ("apps", "v1", "statefulsets"),
            Kind::Route => ("route.openshift.io", "v1", "routes"),
            Kind::ImageStream => ("image.openshift.io", "v1", "imagestreams"),
            Kind::BuildConfig => ("build.openshift.io", "v1", "buildconfigs"),
            Kind::ConfigMap => ("", "v1", "configmaps"),
            Kind::ImageStreamTag => ("image.openshift.io", "v1", "imagestreamtags"),
            Kind::Deployment => ("apps", "v1", "deployments"),
            Kind::KieApp => ("app.kiegroup.org", "v2", "kieapps"),
        }
    }

    pub fn api_version(&self) -> String {
        let (group, version, _) = self.coordinates();
        if group.is_empty() { version.to_string() } else { format!("{}/{}", group, version) }
    }

    pub fn api_resource(&self) -> ApiResource {
        let (group, version, plural) = self.coordinates();
        ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version: self.api_version(),
            kind: self.as_str().to_string(),
            plural: plural.to_string(),
        }
    }

    /// Top-level fields (besides labels and annotations) whose content decides
    /// whether a deployed object has drifted from the requested one.
    pub fn payload_fields(&self) -> &'static [&'static str] {
        match self {
            Kind::Secret => &["data", "stringData", "type"],
            Kind::ConfigMap => &["data", "binaryData"],
            Kind::Role => &["rules"],
            Kind::RoleBinding => &["subjects", "roleRef"],
            Kind::ServiceAccount => &["imagePullSecrets"],
            Kind::ImageStreamTag => &["tag"],
            _ => &["spec"],
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("unsupported kind: {0}")]
    UnsupportedKind(String),
    #[error("object missing apiVersion/kind")]
    MissingType,
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FromStr for Kind {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Kind::OWNED
            .iter()
            .chain([Kind::ConfigMap, Kind::ImageStreamTag, Kind::Deployment, Kind::KieApp].iter())
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| ResourceError::UnsupportedKind(s.to_string()))
    }
}

/// Identity of an object: kind plus namespaced name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A cluster object tagged with its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DynamicObject", into = "DynamicObject")]
pub struct Resource {
    pub kind: Kind,
    pub object: DynamicObject,
}

impl TryFrom<DynamicObject> for Resource {
    type Error = ResourceError;

    fn try_from(object: DynamicObject) -> Result<Self, Self::Error> {
        let kind = object.types.as_ref().ok_or(ResourceError::MissingType)?.kind.parse::<Kind>()?;
        Ok(Self { kind, object })
    }
}

impl From<Resource> for DynamicObject {
    fn from(r: Resource) -> Self { r.object }
}

impl Resource {
    /// Empty object of `kind` named `name`, with type information filled in.
    pub fn new(kind: Kind, name: &str) -> Self {
        Self { kind, object: DynamicObject::new(name, &kind.api_resource()) }
    }

    pub fn from_object(kind: Kind, mut object: DynamicObject) -> Self {
        if object.types.is_none() {
            let ar = kind.api_resource();
            object.types = Some(kube::core::TypeMeta { api_version: ar.api_version, kind: ar.kind });
        }
        Self { kind, object }
    }

    /// Build from a typed value (e.g. a `k8s_openapi` struct) by way of JSON.
    pub fn from_typed<T: Serialize>(kind: Kind, value: &T) -> Result<Self, ResourceError> {
        let object: DynamicObject = serde_json::from_value(serde_json::to_value(value)?)?;
        Ok(Self::from_object(kind, object))
    }

    /// Typed view of the whole object.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, ResourceError> {
        Ok(serde_json::from_value(serde_json::to_value(&self.object)?)?)
    }

    pub fn name(&self) -> &str { self.object.metadata.name.as_deref().unwrap_or_default() }

    pub fn namespace(&self) -> &str { self.object.metadata.namespace.as_deref().unwrap_or_default() }

    pub fn key(&self) -> ResourceKey { ResourceKey::new(self.kind, self.namespace(), self.name()) }

    pub fn uid(&self) -> Option<&str> { self.object.metadata.uid.as_deref() }

    pub fn resource_version(&self) -> Option<&str> { self.object.metadata.resource_version.as_deref() }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.object.metadata.namespace = Some(namespace.to_string());
    }

    pub fn labels(&self) -> BTreeMap<String, String> { self.object.metadata.labels.clone().unwrap_or_default() }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.object.metadata.labels.as_ref().and_then(|l| l.get(key)).map(|s| s.as_str())
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.object.metadata.labels.get_or_insert_with(BTreeMap::new).insert(key.to_string(), value.to_string());
    }

    pub fn owner_references(&self) -> &[OwnerReference] {
        self.object.metadata.owner_references.as_deref().unwrap_or_default()
    }

    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.owner_references().iter().any(|r| r.uid == uid)
    }

    /// Add `owner` unless a reference with the same UID is already present.
    pub fn set_owner(&mut self, owner: OwnerReference) {
        let refs = self.object.metadata.owner_references.get_or_insert_with(Vec::new);
        if !refs.iter().any(|r| r.uid == owner.uid) {
            refs.push(owner);
        }
    }

    pub fn clear_owners(&mut self) { self.object.metadata.owner_references = None; }

    /// A top-level payload field (`spec`, `data`, ...).
    pub fn field(&self, name: &str) -> Option<&Json> { self.object.data.get(name) }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Json> { self.object.data.get_mut(name) }

    pub fn set_field(&mut self, name: &str, value: Json) {
        if !self.object.data.is_object() {
            self.object.data = Json::Object(serde_json::Map::new());
        }
        if let Some(map) = self.object.data.as_object_mut() {
            map.insert(name.to_string(), value);
        }
    }

    /// Typed view of a top-level payload field; `None` when absent or malformed.
    pub fn field_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.field(name).and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Build an owner reference pointing at `owner`, marked as controller.
pub fn controller_reference(owner: &KieApp) -> OwnerReference {
    OwnerReference {
        api_version: Kind::KieApp.api_version(),
        kind: Kind::KieApp.as_str().to_string(),
        name: owner.metadata.name.clone().unwrap_or_default(),
        uid: owner.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// One-to-many "owns" relation keyed by owner UID, rebuilt from scratch each pass.
#[derive(Debug, Default, Clone)]
pub struct OwnershipIndex {
    owned: HashMap<String, HashSet<ResourceKey>>,
}

impl OwnershipIndex {
    pub fn build<'a>(resources: impl IntoIterator<Item = &'a Resource>) -> Self {
        let mut idx = Self::default();
        for r in resources {
            for owner in r.owner_references() {
                idx.owned.entry(owner.uid.clone()).or_default().insert(r.key());
            }
        }
        idx
    }

    pub fn owns(&self, owner_uid: &str, key: &ResourceKey) -> bool {
        self.owned.get(owner_uid).map(|s| s.contains(key)).unwrap_or(false)
    }

    pub fn owned_by(&self, owner_uid: &str) -> impl Iterator<Item = &ResourceKey> {
        self.owned.get(owner_uid).into_iter().flat_map(|s| s.iter())
    }
}

/// Resources grouped by kind.
pub type ResourceMap = BTreeMap<Kind, Vec<Resource>>;

/// Group resources by kind; every kind present in the input gets an entry.
pub fn group_by_kind(resources: impl IntoIterator<Item = Resource>) -> ResourceMap {
    let mut map = ResourceMap::new();
    for r in resources {
        map.entry(r.kind).or_default().push(r);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(kind: Kind, name: &str, owner: &str) -> Resource {
        let mut r = Resource::new(kind, name);
        r.set_namespace("ns");
        r.set_owner(OwnerReference { uid: owner.into(), name: owner.into(), ..Default::default() });
        r
    }

    #[test]
    fn kind_round_trips_through_str() {
        for k in Kind::OWNED {
            assert_eq!(k.as_str().parse::<Kind>().unwrap(), k);
        }
        assert!("Pod".parse::<Kind>().is_err());
    }

    #[test]
    fn api_version_omits_empty_group() {
        assert_eq!(Kind::Secret.api_version(), "v1");
        assert_eq!(Kind::Route.api_version(), "route.openshift.io/v1");
        assert_eq!(Kind::DeploymentConfig.api_resource().plural, "deploymentconfigs");
    }

    #[test]
    fn resource_deserializes_from_manifest() {
        let r: Resource = serde_json::from_value(serde_json::json!({
            "apiVersion": "route.openshift.io/v1",
            "kind": "Route",
            "metadata": { "name": "console" },
            "spec": { "host": "a.example.com" }
        }))
        .unwrap();
        assert_eq!(r.kind, Kind::Route);
        assert_eq!(r.name(), "console");
        assert_eq!(r.field("spec").unwrap()["host"], "a.example.com");
    }

    #[test]
    fn set_owner_is_idempotent() {
        let mut r = owned(Kind::Service, "svc", "uid-a");
        r.set_owner(OwnerReference { uid: "uid-a".into(), ..Default::default() });
        assert_eq!(r.owner_references().len(), 1);
        assert!(r.is_owned_by("uid-a"));
        assert!(!r.is_owned_by("uid-b"));
    }

    #[test]
    fn ownership_index_keys_by_owner_uid() {
        let a = owned(Kind::DeploymentConfig, "a", "uid-a");
        let b = owned(Kind::DeploymentConfig, "b", "uid-b");
        let idx = OwnershipIndex::build([&a, &b]);
        assert!(idx.owns("uid-a", &a.key()));
        assert!(!idx.owns("uid-a", &b.key()));
        assert_eq!(idx.owned_by("uid-b").count(), 1);
        assert_eq!(idx.owned_by("uid-c").count(), 0);
    }
}
