//! Inventory Builder: reconstructs what an instance actually owns in its namespace.

use std::collections::HashSet;

use metrics::histogram;
use tracing::{debug, instrument};

use kieop_core::{Kind, OwnershipIndex, Resource, ResourceMap};

use crate::{ClientError, ClusterClient};

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("listing {kind}: {source}")]
    List { kind: Kind, source: ClientError },
    #[error("fetching secret {name}: {source}")]
    Secret { name: String, source: ClientError },
}

impl InventoryError {
    pub fn client_error(&self) -> &ClientError {
        match self {
            InventoryError::List { source, .. } | InventoryError::Secret { source, .. } => source,
        }
    }
}

/// Workloads whose mounted secrets stand in for a bulk secret listing.
const SECRET_MOUNTING_KINDS: [Kind; 2] = [Kind::DeploymentConfig, Kind::StatefulSet];

/// Every ownable kind gets an entry (possibly empty) in the result.
///
/// Secrets are not listed in bulk: those mounted as volumes by owned
/// deployment configs and stateful sets, plus the `requested_secrets` the
/// caller is about to apply, are fetched one by one, skipping ones that do
/// not exist yet.
#[instrument(level = "debug", skip(client))]
pub async fn build_inventory(
    client: &dyn ClusterClient,
    owner_uid: &str,
    namespace: &str,
    requested_secrets: &[String],
) -> Result<ResourceMap, InventoryError> {
    let started = std::time::Instant::now();
    let mut listed: Vec<Resource> = Vec::new();
    for kind in Kind::OWNED.into_iter().filter(|k| *k != Kind::Secret) {
        let items = client.list(kind, namespace).await.map_err(|source| InventoryError::List { kind, source })?;
        listed.extend(items);
    }

    let mut secret_names: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mounted = listed
        .iter()
        .filter(|r| SECRET_MOUNTING_KINDS.contains(&r.kind) && r.is_owned_by(owner_uid))
        .flat_map(|r| r.secret_volume_names());
    for name in mounted.chain(requested_secrets.iter().cloned()) {
        if seen.insert(name.clone()) {
            secret_names.push(name);
        }
    }
    for name in secret_names {
        match client.get(Kind::Secret, namespace, &name).await {
            Ok(secret) => listed.push(secret),
            Err(e) if e.is_not_found() => debug!(%name, "mounted secret not found"),
            Err(source) => return Err(InventoryError::Secret { name, source }),
        }
    }

    let index = OwnershipIndex::build(listed.iter());
    let mut out: ResourceMap = Kind::OWNED.iter().map(|k| (*k, Vec::new())).collect();
    for r in listed {
        if index.owns(owner_uid, &r.key()) {
            out.entry(r.kind).or_default().push(r);
        }
    }
    histogram!("inventory_build_ms", started.elapsed().as_secs_f64() * 1000.0);
    debug!(owned = out.values().map(Vec::len).sum::<usize>(), "inventory built");
    Ok(out)
}
