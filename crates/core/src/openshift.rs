//! Read-only typed views over the OpenShift kinds the controller inspects.
//! Only the fields the controller consumes are modelled; writes go through
//! JSON pointers on the underlying object so nothing is lost on round trip.

use k8s_openapi::api::core::v1::{ObjectReference, PodTemplateSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{Kind, Resource};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfigSpec {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub triggers: Vec<DeploymentTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
}

pub const IMAGE_CHANGE_TRIGGER: &str = "ImageChange";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTrigger {
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_change_params: Option<ImageChangeParams>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageChangeParams {
    #[serde(default)]
    pub from: ObjectReference,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfigStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub available_replicas: i32,
}

pub const SOURCE_BUILD_STRATEGY: &str = "Source";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfigSpec {
    #[serde(default)]
    pub strategy: BuildStrategy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStrategy {
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_strategy: Option<SourceStrategy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStrategy {
    #[serde(default)]
    pub from: ObjectReference,
}

/// `tag` of an ImageStreamTag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagReference {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_policy: Option<TagReferencePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_policy: Option<TagImportPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagReferencePolicy {
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagImportPolicy {
    #[serde(default)]
    pub insecure: bool,
}

/// An image reference that may need a locally tracked tag, with the JSON
/// pointer of the namespace field to rewrite once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub name: String,
    pub namespace: String,
    pub namespace_pointer: String,
}

impl Resource {
    pub fn route_spec(&self) -> Option<RouteSpec> {
        if self.kind != Kind::Route { return None; }
        self.field_as("spec")
    }

    /// Cluster-assigned or requested hostname of a route; empty when unknown.
    pub fn route_host(&self) -> String {
        self.route_spec().map(|s| s.host).unwrap_or_default()
    }

    pub fn route_has_tls(&self) -> bool {
        self.route_spec().and_then(|s| s.tls).map(|t| !t.is_null()).unwrap_or(false)
    }

    pub fn deployment_config_spec(&self) -> Option<DeploymentConfigSpec> {
        if self.kind != Kind::DeploymentConfig { return None; }
        self.field_as("spec")
    }

    pub fn deployment_config_status(&self) -> DeploymentConfigStatus {
        self.field_as("status").unwrap_or_default()
    }

    /// Names of secrets mounted as volumes by the pod template, in mount order.
    pub fn secret_volume_names(&self) -> Vec<String> {
        let template = match self.kind {
            Kind::DeploymentConfig => self.deployment_config_spec().and_then(|s| s.template),
            Kind::StatefulSet | Kind::Deployment => self
                .field("spec")
                .and_then(|s| s.get("template"))
                .and_then(|t| serde_json::from_value::<PodTemplateSpec>(t.clone()).ok()),
            _ => None,
        };
        template
            .and_then(|t| t.spec)
            .and_then(|s| s.volumes)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.secret.and_then(|s| s.secret_name))
            .collect()
    }

    /// External image references: image-change triggers of a deployment
    /// config and the source image of a Source-strategy build config.
    pub fn image_refs(&self) -> Vec<ImageRef> {
        match self.kind {
            Kind::DeploymentConfig => self
                .deployment_config_spec()
                .map(|s| s.triggers)
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .filter(|(_, t)| t.type_ == IMAGE_CHANGE_TRIGGER)
                .filter_map(|(i, t)| {
                    let from = t.image_change_params?.from;
                    Some(ImageRef {
                        name: from.name.unwrap_or_default(),
                        namespace: from.namespace.unwrap_or_default(),
                        namespace_pointer: format!("/spec/triggers/{}/imageChangeParams/from/namespace", i),
                    })
                })
                .collect(),
            Kind::BuildConfig => {
                let spec: Option<BuildConfigSpec> = self.field_as("spec");
                spec.map(|s| s.strategy)
                    .filter(|s| s.type_ == SOURCE_BUILD_STRATEGY)
                    .and_then(|s| s.source_strategy)
                    .map(|s| ImageRef {
                        name: s.from.name.unwrap_or_default(),
                        namespace: s.from.namespace.unwrap_or_default(),
                        namespace_pointer: "/spec/strategy/sourceStrategy/from/namespace".to_string(),
                    })
                    .into_iter()
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// Rewrite the namespace an image reference points at. Returns false when
    /// the parent of `pointer` does not exist.
    pub fn set_image_namespace(&mut self, pointer: &str, namespace: &str) -> bool {
        let (parent, leaf) = match pointer.rsplit_once('/') {
            Some(p) => p,
            None => return false,
        };
        match self.object.data.pointer_mut(parent).and_then(|v| v.as_object_mut()) {
            Some(obj) => {
                obj.insert(leaf.to_string(), Json::String(namespace.to_string()));
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dc() -> Resource {
        serde_json::from_value(json!({
            "apiVersion": "apps.openshift.io/v1",
            "kind": "DeploymentConfig",
            "metadata": { "name": "app-kieserver", "namespace": "ns" },
            "spec": {
                "replicas": 2,
                "triggers": [
                    { "type": "ConfigChange" },
                    { "type": "ImageChange", "imageChangeParams": { "from": { "kind": "ImageStreamTag", "name": "rhpam-kieserver:7.5.0", "namespace": "openshift" } } }
                ],
                "template": { "spec": {
                    "containers": [],
                    "volumes": [
                        { "name": "keystore", "secret": { "secretName": "app-kieserver-app-secret" } },
                        { "name": "data", "emptyDir": {} }
                    ]
                } }
            },
            "status": { "availableReplicas": 1, "readyReplicas": 1 }
        }))
        .unwrap()
    }

    #[test]
    fn reads_secret_volumes() {
        assert_eq!(dc().secret_volume_names(), vec!["app-kieserver-app-secret".to_string()]);
    }

    #[test]
    fn reads_and_rewrites_image_trigger() {
        let mut r = dc();
        let refs = r.image_refs();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "rhpam-kieserver:7.5.0");
        assert_eq!(refs[0].namespace, "openshift");
        assert!(r.set_image_namespace(&refs[0].namespace_pointer, "ns"));
        assert_eq!(r.image_refs()[0].namespace, "ns");
    }

    #[test]
    fn build_config_only_for_source_strategy() {
        let mut bc: Resource = serde_json::from_value(json!({
            "apiVersion": "build.openshift.io/v1",
            "kind": "BuildConfig",
            "metadata": { "name": "b" },
            "spec": { "strategy": { "type": "Source", "sourceStrategy": { "from": { "name": "builder:1" } } } }
        }))
        .unwrap();
        assert_eq!(bc.image_refs().len(), 1);
        bc.object.data["spec"]["strategy"]["type"] = json!("Docker");
        assert!(bc.image_refs().is_empty());
    }

    #[test]
    fn route_tls_detection() {
        let mut r = Resource::new(Kind::Route, "r");
        r.set_field("spec", json!({ "host": "" }));
        assert!(!r.route_has_tls());
        r.set_field("spec", json!({ "host": "h", "tls": { "termination": "passthrough" } }));
        assert!(r.route_has_tls());
        assert_eq!(r.route_host(), "h");
    }
}
