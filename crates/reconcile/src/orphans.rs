//! Detach the state config maps of servers that were scaled to zero.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use kieop_core::{Kind, Resource};
use kieop_kubehub::ClusterClient;

use crate::compiler::Environment;

pub const SERVER_STATE_LABEL: &str = "services.server.kie.org/kie-server-state";
pub const DETACHED: &str = "DETACHED";

/// Desired replicas of every server deployment config, by name.
fn server_replicas(env: &Environment) -> HashMap<String, i32> {
    env.servers
        .iter()
        .flat_map(|s| s.of_kind(Kind::DeploymentConfig))
        .map(|dc| (dc.name().to_string(), dc.deployment_config_spec().map(|s| s.replicas).unwrap_or_default()))
        .collect()
}

fn attached(cm: &Resource) -> bool { matches!(cm.label(SERVER_STATE_LABEL), Some(v) if !v.is_empty() && v != DETACHED) }

/// Relabel `DETACHED` every attached server state config map in `namespace`
/// whose owning server deployment config is desired at zero replicas and
/// reports none available. Returns how many were relabelled; errors are
/// logged and skipped.
pub async fn detach_orphaned_worker_configs(client: &dyn ClusterClient, namespace: &str, env: &Environment) -> usize {
    let maps = match client.list(Kind::ConfigMap, namespace).await {
        Ok(maps) => maps,
        Err(e) => {
            warn!(%namespace, error = %e, "failed to list config maps");
            return 0;
        }
    };
    let replicas = server_replicas(env);
    let mut detached = 0;
    for mut cm in maps.into_iter().filter(attached) {
        let owner = cm
            .owner_references()
            .iter()
            .find(|o| o.kind == Kind::DeploymentConfig.as_str() && replicas.get(&o.name) == Some(&0))
            .map(|o| o.name.clone());
        let Some(dc_name) = owner else { continue };
        let available = match client.get(Kind::DeploymentConfig, namespace, &dc_name).await {
            Ok(dc) => dc.deployment_config_status().available_replicas,
            Err(e) if e.is_not_found() => 0,
            Err(e) => {
                warn!(name = %dc_name, error = %e, "failed to read server deployment config");
                continue;
            }
        };
        if available != 0 {
            debug!(config_map = %cm.name(), dc = %dc_name, available, "server still running");
            continue;
        }
        info!(config_map = %cm.name(), dc = %dc_name, "server scaled to zero, relabelling config map as detached");
        cm.set_label(SERVER_STATE_LABEL, DETACHED);
        match client.update(&cm).await {
            Ok(_) => detached += 1,
            Err(e) => warn!(config_map = %cm.name(), error = %e, "failed to relabel config map"),
        }
    }
    detached
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Component, ComponentRole};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kieop_kubehub::InMemoryClient;
    use serde_json::json;

    fn dc(name: &str, desired: i32, available: i32) -> Resource {
        let mut r = Resource::new(Kind::DeploymentConfig, name);
        r.set_namespace("ns");
        r.set_field("spec", json!({ "replicas": desired }));
        r.set_field("status", json!({ "availableReplicas": available }));
        r
    }

    fn state_map(name: &str, owner: &str, state: &str) -> Resource {
        let mut r = Resource::new(Kind::ConfigMap, name);
        r.set_namespace("ns");
        r.set_label(SERVER_STATE_LABEL, state);
        r.set_owner(OwnerReference { kind: "DeploymentConfig".into(), name: owner.into(), uid: format!("{}-uid", owner), ..Default::default() });
        r
    }

    fn env(servers: &[(&str, i32)]) -> Environment {
        let mut env = Environment::default();
        for (name, desired) in servers {
            let mut c = Component::new(ComponentRole::Server, name);
            c.resources.push(dc(name, *desired, 0));
            env.servers.push(c);
        }
        env
    }

    #[tokio::test]
    async fn detaches_only_stopped_servers() {
        let client = InMemoryClient::new();
        client.seed(dc("s1", 0, 0)).unwrap();
        client.seed(dc("s2", 1, 1)).unwrap();
        client.seed(dc("s3", 0, 1)).unwrap();
        client.seed(state_map("s1", "s1", "USED")).unwrap();
        client.seed(state_map("s2", "s2", "USED")).unwrap();
        client.seed(state_map("s3", "s3", "USED")).unwrap();
        client.seed(state_map("old", "s1", DETACHED)).unwrap();
        client.seed(state_map("other", "unknown-dc", "USED")).unwrap();

        let n = detach_orphaned_worker_configs(&client, "ns", &env(&[("s1", 0), ("s2", 1), ("s3", 0)])).await;
        assert_eq!(n, 1);
        let s1 = client.get(Kind::ConfigMap, "ns", "s1").await.unwrap();
        assert_eq!(s1.label(SERVER_STATE_LABEL), Some(DETACHED));
        let s3 = client.get(Kind::ConfigMap, "ns", "s3").await.unwrap();
        assert_eq!(s3.label(SERVER_STATE_LABEL), Some("USED"));
        assert_eq!(client.writes().updates, 1);

        // Already detached now.
        assert_eq!(detach_orphaned_worker_configs(&client, "ns", &env(&[("s1", 0)])).await, 0);
    }

    #[tokio::test]
    async fn list_failure_is_not_fatal() {
        let client = InMemoryClient::new();
        client.fail_lists_of(Kind::ConfigMap).unwrap();
        assert_eq!(detach_orphaned_worker_configs(&client, "ns", &env(&[("s1", 0)])).await, 0);
    }
}
