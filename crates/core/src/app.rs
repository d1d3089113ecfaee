//! The `KieApp` custom resource: declared intent (spec) and observed state (status).

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::status::Condition;

/// Registry host used when neither the instance nor the environment names one.
pub const DEFAULT_IMAGE_REGISTRY: &str = "registry.redhat.io";

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "app.kiegroup.org",
    version = "v2",
    kind = "KieApp",
    namespaced,
    status = "KieAppStatus",
    schema = "disabled",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct KieAppSpec {
    /// Environment template name, e.g. `rhpam-trial` or `rhdm-production`.
    #[serde(default)]
    pub environment: String,
    /// Product version, `major.minor.micro`.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub common_config: CommonConfig,
    #[serde(default)]
    pub objects: KieAppObjects,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_registry: Option<KieAppRegistry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonConfig {
    #[serde(default)]
    pub application_name: String,
    #[serde(default)]
    pub key_store_password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KieAppObjects {
    #[serde(default)]
    pub console: ComponentObject,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerSet>,
    #[serde(default)]
    pub smart_router: ComponentObject,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentObject {
    /// Operator-supplied keystore secret; when set no keystore is generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystore_secret: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployments: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystore_secret: Option<String>,
}

/// Registry override for locally tracked image tags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KieAppRegistry {
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KieAppStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub console_host: String,
    /// External URLs of the non-console components, keyed by component name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub component_hosts: BTreeMap<String, String>,
    #[serde(default)]
    pub deployments: Deployments,
}

/// Deployment summary derived from the owned deployment configs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployments {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub starting: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stopped: Vec<String>,
}

impl KieApp {
    pub fn application_name(&self) -> &str { &self.spec.common_config.application_name }

    pub fn namespace_or_default(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or("default") }

    pub fn uid(&self) -> &str { self.metadata.uid.as_deref().unwrap_or_default() }

    pub fn resource_version(&self) -> Option<&str> { self.metadata.resource_version.as_deref() }

    pub fn status_mut(&mut self) -> &mut KieAppStatus { self.status.get_or_insert_with(KieAppStatus::default) }

    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }

    /// `rhdm` for decision-manager environments, `rhpam` otherwise.
    pub fn product(&self) -> &'static str {
        if self.spec.environment.starts_with("rhdm") { "rhdm" } else { "rhpam" }
    }

    /// Major component of `spec.version`; `7` when unset.
    pub fn major_version(&self) -> &str {
        match self.spec.version.split('.').next() {
            Some(m) if !m.is_empty() => m,
            _ => "7",
        }
    }

    /// Registry settings: the instance's override, else environment defaults.
    pub fn registry(&self, default_registry: &str, default_insecure: bool) -> KieAppRegistry {
        let mut reg = self
            .spec
            .image_registry
            .clone()
            .unwrap_or(KieAppRegistry { registry: String::new(), insecure: default_insecure });
        if reg.registry.is_empty() {
            reg.registry = default_registry.to_string();
        }
        reg
    }
}
