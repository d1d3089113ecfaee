//! kieop apply: per-kind diff of requested against deployed resources, and
//! the create/update/remove writes that carry a diff out.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::{debug, info, warn};

use kieop_core::{controller_reference, KieApp, Kind, Resource, ResourceKey, ResourceMap};
use kieop_kubehub::{ClientError, ClusterClient};

/// Content equality for one kind: `(deployed, requested) -> equal`.
pub type EqualFn = fn(&Resource, &Resource) -> bool;

/// Added/updated/removed partition for one kind. `updated` holds the
/// requested versions of objects that drifted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub added: Vec<Resource>,
    pub updated: Vec<Resource>,
    pub removed: Vec<Resource>,
}

impl Delta {
    pub fn has_changes(&self) -> bool { !(self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()) }

    pub fn summary(&self) -> DiffSummary {
        DiffSummary { adds: self.added.len(), updates: self.updated.len(), removes: self.removed.len() }
    }
}

pub type Deltas = BTreeMap<Kind, Delta>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds + self.updates + self.removes == 0 }
}

/// Capability table mapping each kind to its equality rule. Kinds without an
/// entry use [`default_equal`].
#[derive(Clone)]
pub struct Comparator {
    table: HashMap<Kind, EqualFn>,
}

impl Default for Comparator {
    fn default() -> Self {
        let mut table: HashMap<Kind, EqualFn> = HashMap::new();
        table.insert(Kind::Secret, secret_equal);
        table.insert(Kind::ServiceAccount, service_account_equal);
        table.insert(Kind::DeploymentConfig, deployment_config_equal);
        Self { table }
    }
}

impl Comparator {
    /// Table with no overrides: every kind uses [`default_equal`].
    pub fn structural() -> Self { Self { table: HashMap::new() } }

    pub fn with(mut self, kind: Kind, f: EqualFn) -> Self {
        self.table.insert(kind, f);
        self
    }

    pub fn equal(&self, deployed: &Resource, requested: &Resource) -> bool {
        match self.table.get(&requested.kind) {
            Some(f) => f(deployed, requested),
            None => default_equal(deployed, requested),
        }
    }

    /// Partition every kind present on either side. Identity is
    /// `(kind, namespace, name)`; kinds with nothing to do still get an
    /// empty delta so callers can iterate uniformly.
    pub fn compare(&self, deployed: &ResourceMap, requested: &ResourceMap) -> Deltas {
        let t0 = std::time::Instant::now();
        let kinds: BTreeSet<Kind> = deployed.keys().chain(requested.keys()).copied().collect();
        let mut out = Deltas::new();
        for kind in kinds {
            let dep: BTreeMap<ResourceKey, &Resource> =
                deployed.get(&kind).into_iter().flatten().map(|r| (r.key(), r)).collect();
            let req: BTreeMap<ResourceKey, &Resource> =
                requested.get(&kind).into_iter().flatten().map(|r| (r.key(), r)).collect();
            let mut delta = Delta::default();
            for (key, r) in &req {
                match dep.get(key) {
                    None => delta.added.push((*r).clone()),
                    Some(d) if !self.equal(d, r) => delta.updated.push((*r).clone()),
                    Some(_) => {}
                }
            }
            for (key, d) in &dep {
                if !req.contains_key(key) {
                    delta.removed.push((*d).clone());
                }
            }
            if delta.has_changes() {
                debug!(%kind, add = delta.added.len(), update = delta.updated.len(), remove = delta.removed.len(), "delta");
            }
            out.insert(kind, delta);
        }
        histogram!("diff_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        out
    }
}

/// Totals across kinds.
pub fn summarize(deltas: &Deltas) -> DiffSummary {
    deltas.values().map(Delta::summary).fold(DiffSummary::default(), |a, s| DiffSummary {
        adds: a.adds + s.adds,
        updates: a.updates + s.updates,
        removes: a.removes + s.removes,
    })
}

/// The parts of an object that express intent: labels, annotations and the
/// kind's payload fields. Server-populated metadata and status never appear.
pub fn comparable(r: &Resource) -> Json {
    let meta = &r.object.metadata;
    let mut out = Map::new();
    out.insert("labels".into(), serde_json::to_value(meta.labels.clone().unwrap_or_default()).unwrap_or(Json::Null));
    out.insert(
        "annotations".into(),
        serde_json::to_value(meta.annotations.clone().unwrap_or_default()).unwrap_or(Json::Null),
    );
    for field in r.kind.payload_fields() {
        match r.field(field) {
            Some(Json::Null) | None => {}
            Some(v) => {
                out.insert((*field).to_string(), strip_noisy(v.clone()));
            }
        }
    }
    strip_noisy(Json::Object(out))
}

/// Drop nulls and empty containers so that absent and empty compare equal.
fn strip_noisy(v: Json) -> Json {
    match v {
        Json::Object(map) => Json::Object(
            map.into_iter()
                .map(|(k, v)| (k, strip_noisy(v)))
                .filter(|(_, v)| !is_empty_json(v))
                .collect(),
        ),
        Json::Array(arr) => Json::Array(arr.into_iter().map(strip_noisy).collect()),
        other => other,
    }
}

fn is_empty_json(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::Object(m) => m.is_empty(),
        Json::Array(a) => a.is_empty(),
        _ => false,
    }
}

fn is_unset(v: &Json) -> bool { is_empty_json(v) || v.as_str() == Some("") }

/// Whether `deployed` carries everything `requested` sets. Keys the
/// requested side leaves out (or sets to an empty value) are not compared,
/// so fields the API server fills in never read as drift. Arrays must have
/// the same length and match element by element.
pub fn is_derivative(requested: &Json, deployed: &Json) -> bool {
    match (requested, deployed) {
        (r, _) if is_unset(r) => true,
        (Json::Object(r), Json::Object(d)) => r.iter().all(|(k, rv)| match d.get(k) {
            Some(dv) => is_derivative(rv, dv),
            None => is_unset(rv),
        }),
        (Json::Array(r), Json::Array(d)) => r.len() == d.len() && r.iter().zip(d).all(|(rv, dv)| is_derivative(rv, dv)),
        (r, d) => r == d,
    }
}

/// Labels must match exactly; everything else by [`is_derivative`].
fn intent_matches(requested: &Json, deployed: &Json) -> bool {
    requested.get("labels") == deployed.get("labels") && is_derivative(requested, deployed)
}

/// Requested intent must be present in the deployed object. A route
/// requested without a host thereby accepts the one the router assigned.
pub fn default_equal(deployed: &Resource, requested: &Resource) -> bool {
    intent_matches(&comparable(requested), &comparable(deployed))
}

/// Secrets compare on metadata and on the set of payload keys only.
/// `stringData` is folded into `data` the way the API server stores it.
pub fn secret_equal(deployed: &Resource, requested: &Resource) -> bool {
    fn masked(r: &Resource) -> Json {
        let mut c = comparable(r);
        if let Some(obj) = c.as_object_mut() {
            let mut keys: Map<String, Json> = Map::new();
            for field in ["data", "stringData"] {
                if let Some(Json::Object(m)) = obj.remove(field) {
                    keys.extend(m.into_iter().map(|(k, _)| (k, Json::Bool(true))));
                }
            }
            if !keys.is_empty() {
                obj.insert("data".into(), Json::Object(keys));
            }
            obj.entry("type").or_insert_with(|| Json::String("Opaque".into()));
        }
        c
    }
    intent_matches(&masked(requested), &masked(deployed))
}

/// The token controller appends its own pull secrets; requested ones only
/// need to be among them, in any order.
pub fn service_account_equal(deployed: &Resource, requested: &Resource) -> bool {
    fn split(r: &Resource) -> (Json, Vec<Json>) {
        let mut c = comparable(r);
        let pulls = match c.as_object_mut().and_then(|o| o.remove("imagePullSecrets")) {
            Some(Json::Array(a)) => a,
            _ => Vec::new(),
        };
        (c, pulls)
    }
    let (dep, dep_pulls) = split(deployed);
    let (req, req_pulls) = split(requested);
    intent_matches(&req, &dep) && req_pulls.iter().all(|p| dep_pulls.iter().any(|d| is_derivative(p, d)))
}

/// Image-change triggers rewrite the last triggered image and the container
/// images in the template; neither counts as drift.
pub fn deployment_config_equal(deployed: &Resource, requested: &Resource) -> bool {
    fn scrub(r: &Resource) -> Json {
        let mut c = comparable(r);
        let image_triggered = !r.image_refs().is_empty();
        if let Some(spec) = c.get_mut("spec") {
            if let Some(triggers) = spec.get_mut("triggers").and_then(Json::as_array_mut) {
                for t in triggers {
                    if let Some(p) = t.get_mut("imageChangeParams").and_then(Json::as_object_mut) {
                        p.remove("lastTriggeredImage");
                    }
                }
            }
            if image_triggered {
                if let Some(containers) =
                    spec.pointer_mut("/template/spec/containers").and_then(Json::as_array_mut)
                {
                    for c in containers {
                        if let Some(obj) = c.as_object_mut() {
                            obj.remove("image");
                        }
                    }
                }
            }
        }
        strip_noisy(c)
    }
    intent_matches(&scrub(requested), &scrub(deployed))
}

#[derive(Debug, thiserror::Error)]
#[error("{verb} {key}: {source}")]
pub struct ApplyError {
    pub verb: &'static str,
    pub key: ResourceKey,
    #[source]
    pub source: ClientError,
}

impl ApplyError {
    fn new(verb: &'static str, r: &Resource, source: ClientError) -> Self { Self { verb, key: r.key(), source } }
}

/// Create each resource with a controller reference to `owner`.
/// Returns whether anything was written.
pub async fn add_resources(client: &dyn ClusterClient, owner: &KieApp, added: &[Resource]) -> Result<bool, ApplyError> {
    let owner_ref = controller_reference(owner);
    for r in added {
        let mut r = r.clone();
        r.set_owner(owner_ref.clone());
        info!(kind = %r.kind, name = %r.name(), "creating");
        client.create(&r).await.map_err(|e| ApplyError::new("create", &r, e))?;
        counter!("apply_creates_total", 1u64, "kind" => r.kind.as_str());
    }
    Ok(!added.is_empty())
}

/// Replace drifted resources, guarded by the resource version seen in `deployed`.
pub async fn update_resources(
    client: &dyn ClusterClient,
    owner: &KieApp,
    deployed: &[Resource],
    updated: &[Resource],
) -> Result<bool, ApplyError> {
    let owner_ref = controller_reference(owner);
    let live: HashMap<ResourceKey, &Resource> = deployed.iter().map(|r| (r.key(), r)).collect();
    for r in updated {
        let mut r = r.clone();
        r.set_owner(owner_ref.clone());
        match live.get(&r.key()) {
            Some(d) => r.object.metadata.resource_version = d.object.metadata.resource_version.clone(),
            None => warn!(kind = %r.kind, name = %r.name(), "updating object missing from inventory"),
        }
        info!(kind = %r.kind, name = %r.name(), "updating");
        client.update(&r).await.map_err(|e| ApplyError::new("update", &r, e))?;
        counter!("apply_updates_total", 1u64, "kind" => r.kind.as_str());
    }
    Ok(!updated.is_empty())
}

/// Delete resources no longer requested. Already-gone objects are fine.
pub async fn remove_resources(client: &dyn ClusterClient, removed: &[Resource]) -> Result<bool, ApplyError> {
    let mut any = false;
    for r in removed {
        info!(kind = %r.kind, name = %r.name(), "removing");
        match client.delete(r.kind, r.namespace(), r.name()).await {
            Ok(()) => {
                any = true;
                counter!("apply_removes_total", 1u64, "kind" => r.kind.as_str());
            }
            Err(e) if e.is_not_found() => debug!(kind = %r.kind, name = %r.name(), "already gone"),
            Err(e) => return Err(ApplyError::new("delete", r, e)),
        }
    }
    Ok(any)
}

/// Carry out one kind's delta in the fixed order added, updated, removed.
pub async fn apply_delta(
    client: &dyn ClusterClient,
    owner: &KieApp,
    deployed: &[Resource],
    delta: &Delta,
) -> Result<bool, ApplyError> {
    let added = add_resources(client, owner, &delta.added).await?;
    let updated = update_resources(client, owner, deployed, &delta.updated).await?;
    let removed = remove_resources(client, &delta.removed).await?;
    Ok(added || updated || removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kieop_core::{group_by_kind, KieAppSpec};
    use kieop_kubehub::InMemoryClient;
    use serde_json::json;

    fn res(kind: Kind, name: &str, payload: (&str, Json)) -> Resource {
        let mut r = Resource::new(kind, name);
        r.set_namespace("ns");
        r.set_field(payload.0, payload.1);
        r
    }

    fn secret(name: &str, value: &str) -> Resource {
        res(Kind::Secret, name, ("data", json!({ "keystore.jks": value })))
    }

    fn owner() -> KieApp {
        let mut app = KieApp::new("app", KieAppSpec::default());
        app.metadata.namespace = Some("ns".into());
        app.metadata.uid = Some("uid-app".into());
        app
    }

    #[test]
    fn partitions_by_identity_and_content() {
        let deployed = group_by_kind(vec![
            res(Kind::Service, "same", ("spec", json!({ "ports": [1] }))),
            res(Kind::Service, "drift", ("spec", json!({ "ports": [1] }))),
            res(Kind::Service, "gone", ("spec", json!({}))),
        ]);
        let requested = group_by_kind(vec![
            res(Kind::Service, "same", ("spec", json!({ "ports": [1] }))),
            res(Kind::Service, "drift", ("spec", json!({ "ports": [2] }))),
            res(Kind::Service, "new", ("spec", json!({}))),
        ]);
        let deltas = Comparator::default().compare(&deployed, &requested);
        let d = &deltas[&Kind::Service];
        assert_eq!(d.added.iter().map(|r| r.name()).collect::<Vec<_>>(), vec!["new"]);
        assert_eq!(d.updated.iter().map(|r| r.name()).collect::<Vec<_>>(), vec!["drift"]);
        assert_eq!(d.removed.iter().map(|r| r.name()).collect::<Vec<_>>(), vec!["gone"]);
        assert_eq!(summarize(&deltas), DiffSummary { adds: 1, updates: 1, removes: 1 });
    }

    #[test]
    fn server_fields_are_not_drift() {
        let req = res(Kind::Service, "s", ("spec", json!({ "ports": [1] })));
        let mut dep = req.clone();
        dep.object.metadata.resource_version = Some("42".into());
        dep.object.metadata.uid = Some("u".into());
        dep.set_field("status", json!({ "loadBalancer": {} }));
        assert!(Comparator::default().equal(&dep, &req));
    }

    #[test]
    fn secret_payload_is_masked() {
        let c = Comparator::default();
        assert!(c.equal(&secret("s", "AAAA"), &secret("s", "BBBB")));
        let mut labelled = secret("s", "AAAA");
        labelled.set_label("app", "x");
        assert!(!c.equal(&secret("s", "AAAA"), &labelled));
        assert!(!c.equal(&labelled, &secret("s", "AAAA")));
        // Without the override the payload counts.
        assert!(!Comparator::structural().equal(&secret("s", "AAAA"), &secret("s", "BBBB")));
    }

    #[test]
    fn secret_string_data_matches_stored_data() {
        let req = res(Kind::Secret, "s", ("stringData", json!({ "password": "x" })));
        let mut dep = res(Kind::Secret, "s", ("data", json!({ "password": "eA==" })));
        dep.set_field("type", json!("Opaque"));
        assert!(secret_equal(&dep, &req));
    }

    #[test]
    fn route_accepts_assigned_host() {
        let c = Comparator::default();
        let req = res(Kind::Route, "r", ("spec", json!({ "to": { "name": "svc" } })));
        let mut dep = res(
            Kind::Route,
            "r",
            (
                "spec",
                json!({
                    "host": "r-ns.apps.example.com",
                    "to": { "kind": "Service", "name": "svc", "weight": 100 },
                    "wildcardPolicy": "None"
                }),
            ),
        );
        dep.object.metadata.annotations =
            Some([("openshift.io/host.generated".to_string(), "true".to_string())].into_iter().collect());
        assert!(c.equal(&dep, &req));
        let pinned = res(Kind::Route, "r", ("spec", json!({ "host": "other.example.com", "to": { "name": "svc" } })));
        assert!(!c.equal(&dep, &pinned));
    }

    #[test]
    fn service_defaults_are_not_drift() {
        let c = Comparator::default();
        let req = res(
            Kind::Service,
            "s",
            ("spec", json!({ "ports": [{ "name": "http", "port": 8080 }], "selector": { "app": "a" } })),
        );
        let dep = res(
            Kind::Service,
            "s",
            (
                "spec",
                json!({
                    "clusterIP": "172.30.1.5",
                    "clusterIPs": ["172.30.1.5"],
                    "type": "ClusterIP",
                    "sessionAffinity": "None",
                    "ports": [{ "name": "http", "port": 8080, "protocol": "TCP", "targetPort": 8080 }],
                    "selector": { "app": "a" }
                }),
            ),
        );
        assert!(c.equal(&dep, &req));

        let moved = res(Kind::Service, "s", ("spec", json!({ "ports": [{ "name": "http", "port": 9090 }], "selector": { "app": "a" } })));
        assert!(!c.equal(&dep, &moved));
        let extra_port = res(
            Kind::Service,
            "s",
            ("spec", json!({ "ports": [{ "port": 8080 }, { "port": 8443 }], "selector": { "app": "a" } })),
        );
        assert!(!c.equal(&dep, &extra_port));
    }

    #[test]
    fn service_account_keeps_appended_pull_secrets() {
        let c = Comparator::default();
        let req = res(Kind::ServiceAccount, "sa", ("imagePullSecrets", json!([{ "name": "registry" }])));
        let dep = res(
            Kind::ServiceAccount,
            "sa",
            ("imagePullSecrets", json!([{ "name": "sa-dockercfg-x7z2" }, { "name": "registry" }])),
        );
        assert!(c.equal(&dep, &req));
        let other = res(Kind::ServiceAccount, "sa", ("imagePullSecrets", json!([{ "name": "mirror" }])));
        assert!(!c.equal(&dep, &other));
    }

    #[test]
    fn deployment_config_defaults_are_not_drift() {
        let c = Comparator::default();
        let req = res(
            Kind::DeploymentConfig,
            "dc",
            (
                "spec",
                json!({
                    "replicas": 1,
                    "template": { "spec": { "containers": [{ "name": "c", "image": "img:1", "ports": [{ "containerPort": 8080 }] }] } }
                }),
            ),
        );
        let dep = res(
            Kind::DeploymentConfig,
            "dc",
            (
                "spec",
                json!({
                    "replicas": 1,
                    "revisionHistoryLimit": 10,
                    "test": false,
                    "strategy": { "type": "Rolling", "rollingParams": { "timeoutSeconds": 600 } },
                    "template": { "spec": {
                        "containers": [{
                            "name": "c",
                            "image": "img:1",
                            "imagePullPolicy": "IfNotPresent",
                            "terminationMessagePath": "/dev/termination-log",
                            "ports": [{ "containerPort": 8080, "protocol": "TCP" }]
                        }],
                        "restartPolicy": "Always",
                        "dnsPolicy": "ClusterFirst",
                        "schedulerName": "default-scheduler"
                    } }
                }),
            ),
        );
        assert!(c.equal(&dep, &req));
    }

    #[test]
    fn scaling_to_zero_is_drift() {
        let req = res(Kind::DeploymentConfig, "dc", ("spec", json!({ "replicas": 0 })));
        let dep = res(Kind::DeploymentConfig, "dc", ("spec", json!({ "replicas": 1, "test": false })));
        assert!(!Comparator::default().equal(&dep, &req));
    }

    #[test]
    fn deployment_config_ignores_triggered_image() {
        let spec = |image: &str| {
            json!({
                "replicas": 1,
                "triggers": [{ "type": "ImageChange", "imageChangeParams": { "from": { "name": "img:1" } } }],
                "template": { "spec": { "containers": [{ "name": "c", "image": image }] } }
            })
        };
        let req = res(Kind::DeploymentConfig, "dc", ("spec", spec("img:1")));
        let mut dep = res(Kind::DeploymentConfig, "dc", ("spec", spec("registry/img@sha256:abc")));
        dep.object.data["spec"]["triggers"][0]["imageChangeParams"]["lastTriggeredImage"] = json!("registry/img@sha256:abc");
        assert!(deployment_config_equal(&dep, &req));
        let mut scaled = req.clone();
        scaled.object.data["spec"]["replicas"] = json!(0);
        assert!(!deployment_config_equal(&dep, &scaled));
    }

    #[tokio::test]
    async fn apply_sets_owner_and_version() {
        let client = InMemoryClient::new();
        let app = owner();
        let created = res(Kind::Service, "s", ("spec", json!({ "ports": [1] })));
        assert!(add_resources(&client, &app, &[created]).await.unwrap());
        let live = client.get(Kind::Service, "ns", "s").await.unwrap();
        assert!(live.is_owned_by("uid-app"));

        let changed = res(Kind::Service, "s", ("spec", json!({ "ports": [2] })));
        assert!(update_resources(&client, &app, &[live.clone()], &[changed]).await.unwrap());
        let after = client.get(Kind::Service, "ns", "s").await.unwrap();
        assert_eq!(after.field("spec").unwrap()["ports"][0], 2);
        assert_eq!(after.owner_references().len(), 1);

        // A stale version loses.
        let stale = res(Kind::Service, "s", ("spec", json!({ "ports": [3] })));
        let err = update_resources(&client, &app, &[live], &[stale]).await.unwrap_err();
        assert!(err.source.is_conflict());
    }

    #[tokio::test]
    async fn remove_ignores_missing() {
        let client = InMemoryClient::new();
        let app = owner();
        let r = res(Kind::Service, "s", ("spec", json!({})));
        add_resources(&client, &app, &[r.clone()]).await.unwrap();
        assert!(remove_resources(&client, &[r.clone()]).await.unwrap());
        assert!(!remove_resources(&client, &[r]).await.unwrap());
    }
}
