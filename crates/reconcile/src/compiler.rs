//! The desired-state template compiler seam and the environment it produces.
//!
//! Rendering product templates is not this crate's concern: a compiler turns
//! an instance into an [`Environment`] of components, each holding the typed
//! resources it wants deployed. [`EnvironmentFileCompiler`] serves a
//! pre-rendered environment from a YAML file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use kieop_core::{KieApp, Kind, Resource};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentRole {
    Console,
    Server,
    SmartRouter,
    #[default]
    Other,
}

/// One logical component of the deployment (console, a server, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    #[serde(default)]
    pub role: ComponentRole,
    /// Deployment name of the component; keystore secrets derive from it.
    pub name: String,
    /// Omitted components contribute nothing: no routes, hosts or secrets.
    #[serde(default)]
    pub omit: bool,
    /// Operator-supplied keystore secret. When set no keystore is generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystore_secret: Option<String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Component {
    pub fn new(role: ComponentRole, name: &str) -> Self {
        Self { role, name: name.to_string(), ..Default::default() }
    }

    pub fn of_kind(&self, kind: Kind) -> impl Iterator<Item = &Resource> {
        self.resources.iter().filter(move |r| r.kind == kind)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Resource> { self.of_kind(Kind::Route) }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    #[serde(default)]
    pub console: Component,
    #[serde(default)]
    pub servers: Vec<Component>,
    #[serde(default)]
    pub smart_router: Component,
    #[serde(default)]
    pub others: Vec<Component>,
}

impl Environment {
    /// Console, servers, smart router, then others.
    pub fn components(&self) -> impl Iterator<Item = &Component> {
        std::iter::once(&self.console)
            .chain(self.servers.iter())
            .chain(std::iter::once(&self.smart_router))
            .chain(self.others.iter())
    }

    pub fn components_mut(&mut self) -> impl Iterator<Item = &mut Component> {
        std::iter::once(&mut self.console)
            .chain(self.servers.iter_mut())
            .chain(std::iter::once(&mut self.smart_router))
            .chain(self.others.iter_mut())
    }

    pub fn active(&self) -> impl Iterator<Item = &Component> { self.components().filter(|c| !c.omit) }

    /// Every resource of every non-omitted component.
    pub fn resources(&self) -> Vec<Resource> { self.active().flat_map(|c| c.resources.iter().cloned()).collect() }

    /// Stamp roles from position, for environments deserialized without them.
    pub fn assign_roles(&mut self) {
        self.console.role = ComponentRole::Console;
        self.smart_router.role = ComponentRole::SmartRouter;
        for s in &mut self.servers {
            s.role = ComponentRole::Server;
        }
        for o in &mut self.others {
            o.role = ComponentRole::Other;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The declared intent cannot be rendered.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("parsing environment: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Renders an instance into the environment to deploy.
pub trait TemplateCompiler: Send + Sync {
    /// May default spec fields of `app` in place; the orchestrator persists them.
    fn compile(&self, app: &mut KieApp) -> Result<Environment, CompileError>;

    /// Apply a resolved hostname to a component's resources (env vars and the like).
    fn configure_hostname(&self, _component: &mut Component, _app: &KieApp, _host: &str) {}

    /// Adjustments once hostnames and keystores are known.
    fn finalize(&self, env: Environment, _app: &KieApp) -> Environment { env }

    /// Config maps the operator ships for its own Deployment.
    fn config_artifacts(&self, _operator: &Resource) -> Vec<Resource> { Vec::new() }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvironmentFile {
    #[serde(flatten)]
    environment: Environment,
    #[serde(default)]
    config_artifacts: Vec<Resource>,
}

/// Serves a pre-rendered environment read from YAML, with keystore secrets
/// taken from the instance's `objects` where the file leaves them unset.
#[derive(Debug, Clone)]
pub struct EnvironmentFileCompiler {
    file: EnvironmentFile,
}

impl EnvironmentFileCompiler {
    pub fn from_path(path: &Path) -> Result<Self, CompileError> {
        let text = std::fs::read_to_string(path).map_err(|source| CompileError::Io { path: path.to_path_buf(), source })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, CompileError> {
        let mut file: EnvironmentFile = serde_yaml::from_str(text)?;
        file.environment.assign_roles();
        Ok(Self { file })
    }
}

impl TemplateCompiler for EnvironmentFileCompiler {
    fn compile(&self, app: &mut KieApp) -> Result<Environment, CompileError> {
        if app.application_name().is_empty() {
            return Err(CompileError::Invalid("commonConfig.applicationName must be set".into()));
        }
        let mut env = self.file.environment.clone();
        let objects = &app.spec.objects;
        if env.console.keystore_secret.is_none() {
            env.console.keystore_secret = objects.console.keystore_secret.clone();
        }
        if env.smart_router.keystore_secret.is_none() {
            env.smart_router.keystore_secret = objects.smart_router.keystore_secret.clone();
        }
        // Each server set expands to `deployments` server components, in order.
        let set_secrets = objects
            .servers
            .iter()
            .flat_map(|set| std::iter::repeat(set.keystore_secret.clone()).take(set.deployments.unwrap_or(1) as usize));
        for (server, secret) in env.servers.iter_mut().zip(set_secrets) {
            if server.keystore_secret.is_none() {
                server.keystore_secret = secret;
            }
        }
        Ok(env)
    }

    fn config_artifacts(&self, operator: &Resource) -> Vec<Resource> {
        let owner = operator_reference(operator);
        self.file
            .config_artifacts
            .iter()
            .filter(|r| r.kind == Kind::ConfigMap)
            .cloned()
            .map(|mut cm| {
                cm.set_namespace(operator.namespace());
                if let Some(o) = owner.clone() {
                    cm.set_owner(o);
                }
                cm
            })
            .collect()
    }
}

fn operator_reference(operator: &Resource) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: Kind::Deployment.api_version(),
        kind: Kind::Deployment.as_str().to_string(),
        name: operator.name().to_string(),
        uid: operator.uid()?.to_string(),
        controller: Some(true),
        block_owner_deletion: None,
    })
}
