//! kieop kubehub: the cluster access seam used by every reconcile component.
//!
//! `ClusterClient` is the get/list/create/update/delete surface the core depends on.
//! Each call is a single bounded request; nothing is assumed consistent across calls.
//! `KubeClient` talks to a real API server, `InMemoryClient` backs tests and dry runs.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::DynamicObject,
    Client,
};
use metrics::counter;
use tracing::{debug, warn};

use kieop_core::{KieApp, Kind, Resource, ResourceError};

mod inventory;
mod memory;

pub use inventory::{build_inventory, InventoryError};
pub use memory::{InMemoryClient, WriteCounts};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Optimistic-concurrency loss: the object changed since it was read.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("resource: {0}")]
    Resource(#[from] ResourceError),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("kube: {0}")]
    Kube(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool { matches!(self, ClientError::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, ClientError::AlreadyExists(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, ClientError::Conflict(_)) }
}

impl From<kube::Error> for ClientError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) => match (resp.code, resp.reason.as_str()) {
                (404, _) => ClientError::NotFound(resp.message),
                (409, "AlreadyExists") => ClientError::AlreadyExists(resp.message),
                (409, _) => ClientError::Conflict(resp.message),
                (code, _) => ClientError::Api { code, message: resp.message },
            },
            other => ClientError::Kube(other.to_string()),
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Cluster object store primitives.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, kind: Kind, namespace: &str, name: &str) -> ClientResult<Resource>;

    /// All objects of `kind` in `namespace`.
    async fn list(&self, kind: Kind, namespace: &str) -> ClientResult<Vec<Resource>>;

    /// Fails with `AlreadyExists` when the identity is taken.
    async fn create(&self, resource: &Resource) -> ClientResult<Resource>;

    /// Versioned write: fails with `Conflict` when `metadata.resourceVersion`
    /// no longer matches the live object.
    async fn update(&self, resource: &Resource) -> ClientResult<Resource>;

    async fn delete(&self, kind: Kind, namespace: &str, name: &str) -> ClientResult<()>;

    /// Read served from the client's cache when it keeps one.
    async fn get_cached(&self, kind: Kind, namespace: &str, name: &str) -> ClientResult<Resource> {
        self.get(kind, namespace, name).await
    }

    async fn get_opt(&self, kind: Kind, namespace: &str, name: &str) -> ClientResult<Option<Resource>> {
        match self.get(kind, namespace, name).await {
            Ok(r) => Ok(Some(r)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_app(&self, namespace: &str, name: &str) -> ClientResult<KieApp> {
        Ok(self.get(Kind::KieApp, namespace, name).await?.to_typed()?)
    }

    async fn get_app_cached(&self, namespace: &str, name: &str) -> ClientResult<KieApp> {
        Ok(self.get_cached(Kind::KieApp, namespace, name).await?.to_typed()?)
    }

    /// Persist spec and status of an instance, guarded by its resource version.
    async fn update_app(&self, app: &KieApp) -> ClientResult<KieApp> {
        let r = Resource::from_typed(Kind::KieApp, app)?;
        Ok(self.update(&r).await?.to_typed()?)
    }
}

/// `ClusterClient` over a kube-rs `Client`, using dynamic APIs per kind.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Client from the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> ClientResult<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    pub fn inner(&self) -> &Client { &self.client }

    fn api(&self, kind: Kind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn get(&self, kind: Kind, namespace: &str, name: &str) -> ClientResult<Resource> {
        counter!("kube_requests_total", 1u64, "verb" => "get");
        let obj = self.api(kind, namespace).get(name).await?;
        Ok(Resource::from_object(kind, obj))
    }

    async fn list(&self, kind: Kind, namespace: &str) -> ClientResult<Vec<Resource>> {
        counter!("kube_requests_total", 1u64, "verb" => "list");
        let list = self.api(kind, namespace).list(&ListParams::default()).await?;
        debug!(%kind, ns = %namespace, count = list.items.len(), "listed");
        Ok(list.items.into_iter().map(|o| Resource::from_object(kind, o)).collect())
    }

    async fn create(&self, resource: &Resource) -> ClientResult<Resource> {
        counter!("kube_requests_total", 1u64, "verb" => "create");
        let obj = self.api(resource.kind, resource.namespace()).create(&PostParams::default(), &resource.object).await?;
        Ok(Resource::from_object(resource.kind, obj))
    }

    async fn update(&self, resource: &Resource) -> ClientResult<Resource> {
        counter!("kube_requests_total", 1u64, "verb" => "update");
        let api = self.api(resource.kind, resource.namespace());
        let pp = PostParams::default();
        let mut obj = api.replace(resource.name(), &pp, &resource.object).await?;
        // The instance keeps its status behind the status subresource.
        if resource.kind == Kind::KieApp {
            if let Some(status) = resource.field("status") {
                let mut with_status = obj.clone();
                with_status.data["status"] = status.clone();
                match api.replace_status(resource.name(), &pp, serde_json::to_vec(&with_status)?).await {
                    Ok(o) => obj = o,
                    Err(e) => {
                        warn!(name = %resource.name(), error = %e, "status update failed");
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(Resource::from_object(resource.kind, obj))
    }

    async fn delete(&self, kind: Kind, namespace: &str, name: &str) -> ClientResult<()> {
        counter!("kube_requests_total", 1u64, "verb" => "delete");
        self.api(kind, namespace).delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
