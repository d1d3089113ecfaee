//! Config artifact versioner: create operator-shipped config maps that are
//! missing, and keep one backup of a live config map whose content no longer
//! matches what the operator ships.

use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use kieop_core::{Kind, Resource};
use kieop_kubehub::{ClientError, ClusterClient};

/// Annotation whose value names the version of a shipped config map.
pub const VERSION_ANNOTATION: &str = "app.kiegroup.org";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactStats {
    pub created: usize,
    pub backups_created: usize,
    pub backups_updated: usize,
}

/// `<name>-testdata...` maps are test fixtures and never reconciled.
pub fn is_test_fixture(name: &str) -> bool { name.split('-').nth(1) == Some("testdata") }

/// `<name>-bak`, or `<name>-<version>-bak` when `generated` carries the
/// version annotation.
pub fn backup_name(generated: &Resource) -> String {
    let version = generated.object.metadata.annotations.as_ref().and_then(|a| a.get(VERSION_ANNOTATION));
    match version {
        Some(v) => format!("{}-{}-bak", generated.name(), v),
        None => format!("{}-bak", generated.name()),
    }
}

fn payload(r: &Resource, field: &str) -> Json {
    match r.field(field) {
        Some(Json::Null) | None => Json::Object(Default::default()),
        Some(v) => v.clone(),
    }
}

/// Both `data` and `binaryData` equal, absent maps counting as empty.
pub fn data_equal(a: &Resource, b: &Resource) -> bool {
    payload(a, "data") == payload(b, "data") && payload(a, "binaryData") == payload(b, "binaryData")
}

/// Reconcile each generated config map against the live one of the same name.
/// Failures are logged per artifact and never abort the rest.
pub async fn reconcile_artifacts(client: &dyn ClusterClient, generated: &[Resource]) -> ArtifactStats {
    let mut stats = ArtifactStats::default();
    for cm in generated.iter().filter(|r| r.kind == Kind::ConfigMap) {
        if is_test_fixture(cm.name()) {
            debug!(name = %cm.name(), "skipping test fixture");
            continue;
        }
        if let Err(e) = reconcile_one(client, cm, &mut stats).await {
            warn!(name = %cm.name(), namespace = %cm.namespace(), error = %e, "config artifact reconcile failed");
        }
    }
    stats
}

async fn reconcile_one(client: &dyn ClusterClient, cm: &Resource, stats: &mut ArtifactStats) -> Result<(), ClientError> {
    let live = match client.get_opt(Kind::ConfigMap, cm.namespace(), cm.name()).await? {
        Some(live) => live,
        None => {
            info!(name = %cm.name(), namespace = %cm.namespace(), "creating config map");
            create_tolerant(client, cm).await?;
            stats.created += 1;
            return Ok(());
        }
    };
    if data_equal(cm, &live) {
        return Ok(());
    }
    info!(name = %cm.name(), "differences detected in config map");

    // The backup is a copy of the live content that outlives its owner.
    let mut backup = live.clone();
    backup.object.metadata.name = Some(backup_name(cm));
    backup.object.metadata.resource_version = None;
    backup.object.metadata.uid = None;
    backup.clear_owners();

    match client.get_opt(Kind::ConfigMap, backup.namespace(), backup.name()).await? {
        None => {
            info!(name = %backup.name(), "creating config map backup");
            create_tolerant(client, &backup).await?;
            stats.backups_created += 1;
            counter!("config_backups_total", 1u64);
        }
        Some(mut existing) if !data_equal(&backup, &existing) => {
            info!(name = %backup.name(), "overwriting config map backup");
            existing.set_field("data", payload(&backup, "data"));
            existing.set_field("binaryData", payload(&backup, "binaryData"));
            client.update(&existing).await?;
            stats.backups_updated += 1;
            counter!("config_backups_total", 1u64);
        }
        Some(_) => debug!(name = %backup.name(), "backup up to date"),
    }
    Ok(())
}

async fn create_tolerant(client: &dyn ClusterClient, r: &Resource) -> Result<(), ClientError> {
    match client.create(r).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kieop_kubehub::InMemoryClient;
    use serde_json::json;

    fn cm(name: &str, data: Json) -> Resource {
        let mut r = Resource::new(Kind::ConfigMap, name);
        r.set_namespace("ops");
        r.set_field("data", data);
        r
    }

    fn versioned(name: &str, version: &str, data: Json) -> Resource {
        let mut r = cm(name, data);
        r.object.metadata.annotations = Some([(VERSION_ANNOTATION.to_string(), version.to_string())].into_iter().collect());
        r
    }

    #[test]
    fn fixtures_and_backup_names() {
        assert!(is_test_fixture("kieconfigs-testdata-7.5"));
        assert!(!is_test_fixture("kieconfigs-7.5.0"));
        assert!(!is_test_fixture("testdata"));
        assert_eq!(backup_name(&cm("kieconfigs", json!({}))), "kieconfigs-bak");
        assert_eq!(backup_name(&versioned("kieconfigs", "7.5.0", json!({}))), "kieconfigs-7.5.0-bak");
    }

    #[test]
    fn absent_payloads_equal_empty() {
        let mut a = Resource::new(Kind::ConfigMap, "a");
        let b = cm("a", json!({}));
        assert!(data_equal(&a, &b));
        a.set_field("binaryData", json!({ "k": "AA==" }));
        assert!(!data_equal(&a, &b));
    }

    #[tokio::test]
    async fn creates_missing_and_skips_fixtures() {
        let client = InMemoryClient::new();
        let stats = reconcile_artifacts(&client, &[cm("kieconfigs", json!({ "a": "1" })), cm("x-testdata", json!({}))]).await;
        assert_eq!(stats, ArtifactStats { created: 1, ..Default::default() });
        assert_eq!(client.snapshot(Kind::ConfigMap).len(), 1);
    }

    #[tokio::test]
    async fn divergence_is_backed_up_once() {
        let client = InMemoryClient::new();
        let mut live = cm("kieconfigs", json!({ "a": "old" }));
        live.set_owner(OwnerReference { name: "op".into(), uid: "op-uid".into(), ..Default::default() });
        client.seed(live).unwrap();
        let generated = versioned("kieconfigs", "7.5.0", json!({ "a": "new" }));

        let stats = reconcile_artifacts(&client, &[generated.clone()]).await;
        assert_eq!(stats.backups_created, 1);
        let backup = client.get(Kind::ConfigMap, "ops", "kieconfigs-7.5.0-bak").await.unwrap();
        assert_eq!(backup.field("data"), Some(&json!({ "a": "old" })));
        assert!(backup.owner_references().is_empty());
        // The live map is left as it is.
        let still = client.get(Kind::ConfigMap, "ops", "kieconfigs").await.unwrap();
        assert_eq!(still.field("data"), Some(&json!({ "a": "old" })));

        let writes = client.writes();
        assert_eq!(reconcile_artifacts(&client, &[generated]).await, ArtifactStats::default());
        assert_eq!(client.writes(), writes);
    }

    #[tokio::test]
    async fn stale_backup_is_overwritten() {
        let client = InMemoryClient::new();
        client.seed(cm("kieconfigs", json!({ "a": "old" }))).unwrap();
        client.seed(cm("kieconfigs-bak", json!({ "a": "older" }))).unwrap();
        let stats = reconcile_artifacts(&client, &[cm("kieconfigs", json!({ "a": "new" }))]).await;
        assert_eq!(stats.backups_updated, 1);
        let backup = client.get(Kind::ConfigMap, "ops", "kieconfigs-bak").await.unwrap();
        assert_eq!(backup.field("data"), Some(&json!({ "a": "old" })));
    }
}
