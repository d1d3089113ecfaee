//! In-memory `ClusterClient` keeping objects in a map keyed by identity.
//! It mimics the parts of API server behaviour the controller relies on:
//! UID assignment, resource versions bumped on every write, optimistic
//! concurrency on update and, optionally, router-assigned route hosts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value as Json;
use uuid::Uuid;

use kieop_core::{Kind, Resource, ResourceKey};

use crate::{ClientError, ClientResult, ClusterClient};

/// Number of mutating calls served, for idempotence checks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteCounts {
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl WriteCounts {
    pub fn total(&self) -> u64 { self.creates + self.updates + self.deletes }
}

#[derive(Debug, Default)]
pub struct InMemoryClient {
    store: RwLock<HashMap<ResourceKey, Resource>>,
    /// Objects served by `get_cached` instead of the live copy.
    stale: RwLock<HashMap<ResourceKey, Resource>>,
    failing_lists: RwLock<HashSet<Kind>>,
    /// Kinds whose next update loses to a concurrent writer.
    conflicting_updates: RwLock<HashSet<Kind>>,
    writes: RwLock<WriteCounts>,
    version: AtomicU64,
    route_domain: Option<String>,
}

fn poisoned<T>(_: PoisonError<T>) -> ClientError { ClientError::Kube("lock poisoned".into()) }

impl InMemoryClient {
    pub fn new() -> Self { Self::default() }

    /// Assign `<name>-<namespace>.<domain>` to routes created without a host.
    pub fn with_route_domain(mut self, domain: &str) -> Self {
        self.route_domain = Some(domain.to_string());
        self
    }

    fn next_version(&self) -> String { (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string() }

    /// Store an object as-is (bypassing create semantics), filling in UID and version.
    pub fn seed(&self, mut resource: Resource) -> ClientResult<Resource> {
        if resource.object.metadata.uid.is_none() {
            resource.object.metadata.uid = Some(Uuid::new_v4().to_string());
        }
        resource.object.metadata.resource_version = Some(self.next_version());
        self.store.write().map_err(poisoned)?.insert(resource.key(), resource.clone());
        Ok(resource)
    }

    /// Make `get_cached` return `resource` for its identity until cleared.
    pub fn set_stale(&self, resource: Resource) -> ClientResult<()> {
        self.stale.write().map_err(poisoned)?.insert(resource.key(), resource);
        Ok(())
    }

    /// Make every `list` of `kind` fail with an API error.
    pub fn fail_lists_of(&self, kind: Kind) -> ClientResult<()> {
        self.failing_lists.write().map_err(poisoned)?.insert(kind);
        Ok(())
    }

    /// Fail the next `update` of `kind` with `Conflict`, as if another writer
    /// got there first. The object itself is left untouched.
    pub fn conflict_next_update_of(&self, kind: Kind) -> ClientResult<()> {
        self.conflicting_updates.write().map_err(poisoned)?.insert(kind);
        Ok(())
    }

    pub fn writes(&self) -> WriteCounts { self.writes.read().map(|w| *w).unwrap_or_default() }

    pub fn snapshot(&self, kind: Kind) -> Vec<Resource> {
        let mut out: Vec<Resource> = self
            .store
            .read()
            .map(|s| s.values().filter(|r| r.kind == kind).cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    fn record(&self, f: impl FnOnce(&mut WriteCounts)) -> ClientResult<()> {
        f(&mut *self.writes.write().map_err(poisoned)?);
        Ok(())
    }

    fn assign_route_host(&self, resource: &mut Resource) {
        let domain = match (&self.route_domain, resource.kind) {
            (Some(d), Kind::Route) => d.clone(),
            _ => return,
        };
        if !resource.route_host().is_empty() {
            return;
        }
        let host = format!("{}-{}.{}", resource.name(), resource.namespace(), domain);
        let mut spec = resource.field("spec").cloned().unwrap_or_else(|| Json::Object(Default::default()));
        if let Some(obj) = spec.as_object_mut() {
            obj.insert("host".into(), Json::String(host));
        }
        resource.set_field("spec", spec);
    }
}

#[async_trait]
impl ClusterClient for InMemoryClient {
    async fn get(&self, kind: Kind, namespace: &str, name: &str) -> ClientResult<Resource> {
        let key = ResourceKey::new(kind, namespace, name);
        self.store.read().map_err(poisoned)?.get(&key).cloned().ok_or_else(|| ClientError::NotFound(key.to_string()))
    }

    async fn list(&self, kind: Kind, namespace: &str) -> ClientResult<Vec<Resource>> {
        if self.failing_lists.read().map_err(poisoned)?.contains(&kind) {
            return Err(ClientError::Api { code: 500, message: format!("list {} failed", kind) });
        }
        let mut out: Vec<Resource> = self
            .store
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|r| r.kind == kind && r.namespace() == namespace)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(out)
    }

    async fn get_cached(&self, kind: Kind, namespace: &str, name: &str) -> ClientResult<Resource> {
        let key = ResourceKey::new(kind, namespace, name);
        if let Some(r) = self.stale.read().map_err(poisoned)?.get(&key) {
            return Ok(r.clone());
        }
        self.get(kind, namespace, name).await
    }

    async fn create(&self, resource: &Resource) -> ClientResult<Resource> {
        let key = resource.key();
        let mut created = resource.clone();
        created.object.metadata.uid = Some(Uuid::new_v4().to_string());
        created.object.metadata.resource_version = Some(self.next_version());
        self.assign_route_host(&mut created);
        {
            let mut store = self.store.write().map_err(poisoned)?;
            if store.contains_key(&key) {
                return Err(ClientError::AlreadyExists(key.to_string()));
            }
            store.insert(key, created.clone());
        }
        self.record(|w| w.creates += 1)?;
        Ok(created)
    }

    async fn update(&self, resource: &Resource) -> ClientResult<Resource> {
        let key = resource.key();
        if self.conflicting_updates.write().map_err(poisoned)?.remove(&resource.kind) {
            return Err(ClientError::Conflict(format!("{}: modified concurrently", key)));
        }
        let mut updated = resource.clone();
        {
            let mut store = self.store.write().map_err(poisoned)?;
            let live = store.get(&key).ok_or_else(|| ClientError::NotFound(key.to_string()))?;
            if let Some(expected) = resource.resource_version() {
                if live.resource_version() != Some(expected) {
                    return Err(ClientError::Conflict(format!(
                        "{}: resource version {} is stale (live {})",
                        key,
                        expected,
                        live.resource_version().unwrap_or_default()
                    )));
                }
            }
            updated.object.metadata.uid = live.object.metadata.uid.clone();
            updated.object.metadata.resource_version = Some(self.next_version());
            store.insert(key, updated.clone());
        }
        self.record(|w| w.updates += 1)?;
        Ok(updated)
    }

    async fn delete(&self, kind: Kind, namespace: &str, name: &str) -> ClientResult<()> {
        let key = ResourceKey::new(kind, namespace, name);
        self.store.write().map_err(poisoned)?.remove(&key).ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        self.record(|w| w.deletes += 1)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str) -> Resource {
        let mut r = Resource::new(Kind::Service, name);
        r.set_namespace("default");
        r
    }

    #[tokio::test]
    async fn create_get_delete() {
        let client = InMemoryClient::new();
        let created = client.create(&svc("a")).await.unwrap();
        assert!(created.uid().is_some());
        let got = client.get(Kind::Service, "default", "a").await.unwrap();
        assert_eq!(got, created);
        client.delete(Kind::Service, "default", "a").await.unwrap();
        assert!(client.get(Kind::Service, "default", "a").await.unwrap_err().is_not_found());
        assert_eq!(client.writes(), WriteCounts { creates: 1, updates: 0, deletes: 1 });
    }

    #[tokio::test]
    async fn create_twice_already_exists() {
        let client = InMemoryClient::new();
        client.create(&svc("a")).await.unwrap();
        assert!(client.create(&svc("a")).await.unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let client = InMemoryClient::new();
        let v1 = client.create(&svc("a")).await.unwrap();
        let v2 = client.update(&v1).await.unwrap();
        assert_ne!(v1.resource_version(), v2.resource_version());
        assert!(client.update(&v1).await.unwrap_err().is_conflict());
        assert_eq!(v2.uid(), v1.uid());
    }

    #[tokio::test]
    async fn injected_conflict_fires_once() {
        let client = InMemoryClient::new();
        let v1 = client.create(&svc("a")).await.unwrap();
        client.conflict_next_update_of(Kind::Service).unwrap();
        assert!(client.update(&v1).await.unwrap_err().is_conflict());
        assert_eq!(client.get(Kind::Service, "default", "a").await.unwrap(), v1);
        assert!(client.update(&v1).await.is_ok());
        assert_eq!(client.writes().updates, 1);
    }

    #[tokio::test]
    async fn list_is_namespace_scoped() {
        let client = InMemoryClient::new();
        client.create(&svc("a")).await.unwrap();
        let mut other = svc("b");
        other.set_namespace("other");
        client.create(&other).await.unwrap();
        let listed = client.list(Kind::Service, "default").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name(), "a");
    }

    #[tokio::test]
    async fn routes_get_hosts_when_domain_set() {
        let client = InMemoryClient::new().with_route_domain("apps.example.com");
        let mut route = Resource::new(Kind::Route, "console");
        route.set_namespace("ns");
        let created = client.create(&route).await.unwrap();
        assert_eq!(created.route_host(), "console-ns.apps.example.com");
    }
}
