//! kieop reconcile: one convergence pass of a `KieApp` instance.
//!
//! A pass reads the instance, has the template compiler render the desired
//! environment, makes sure its routes exist (waiting briefly for the router to
//! assign hosts), derives certificates and URLs from those hosts, resolves
//! image references, diffs the result against the owned inventory and applies
//! the deltas. It finishes by versioning the operator's config artifacts,
//! detaching state of stopped servers and settling the status conditions.
//!
//! Every write of the instance is guarded by the resource version it was read
//! at; losing that race ends the pass with [`Outcome::Requeue`].

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tracing::{debug, info, info_span, warn, Instrument};

use kieop_apply::{add_resources, apply_delta, ApplyError, Comparator, Deltas};
use kieop_core::status::{self, ReasonType};
use kieop_core::{group_by_kind, KieApp, Kind, Resource, ResourceKey, ResourceMap};
use kieop_kubehub::{build_inventory, ClientError, ClusterClient, InventoryError};
use kieop_pki::PkiError;

pub mod artifacts;
pub mod compiler;
pub mod config;
pub mod images;
pub mod orphans;
pub mod routes;

pub use compiler::{CompileError, Component, ComponentRole, Environment, EnvironmentFileCompiler, TemplateCompiler};
pub use config::OperatorSettings;

use crate::images::ImageResolver;

/// How a pass ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged; wait for the next change.
    Done,
    /// Run another pass right away.
    Requeue,
    /// Run another pass after the delay (route hosts pending).
    RequeueAfter(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("cluster: {0}")]
    Client(#[from] ClientError),
    #[error("configuration: {0}")]
    Configuration(#[from] CompileError),
    #[error("keystore: {0}")]
    Keystore(#[from] PkiError),
    #[error("apply: {0}")]
    Apply(#[from] ApplyError),
    #[error("inventory: {0}")]
    Inventory(#[from] InventoryError),
}

/// What a pass would do, computed without writing anything.
#[derive(Debug, Default)]
pub struct Plan {
    /// Requested routes that do not exist yet.
    pub missing_routes: Vec<ResourceKey>,
    pub deltas: Deltas,
}

pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    compiler: Arc<dyn TemplateCompiler>,
    settings: OperatorSettings,
    comparator: Comparator,
}

/// The instance after rendering, with the environment and resources to deploy.
struct Desired {
    app: KieApp,
    env: Environment,
    requested: ResourceMap,
}

enum Rendered {
    Ready(Desired),
    Gone,
    RoutesPending { app: KieApp, missing: Vec<Resource> },
}

/// Secrets are inventoried by name, so the ones about to be applied are
/// looked up explicitly alongside those mounted by owned workloads.
fn secret_names(requested: &ResourceMap) -> Vec<String> {
    requested.get(&Kind::Secret).into_iter().flatten().map(|r| r.name().to_string()).collect()
}

impl Reconciler {
    pub fn new(client: Arc<dyn ClusterClient>, compiler: Arc<dyn TemplateCompiler>, settings: OperatorSettings) -> Self {
        Self { client, compiler, settings, comparator: Comparator::default() }
    }

    pub fn with_comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn settings(&self) -> &OperatorSettings { &self.settings }

    /// Run one pass for the instance `namespace/name`.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Outcome, ReconcileError> {
        let started = Instant::now();
        counter!("reconcile_passes_total", 1u64);
        let span = info_span!("reconcile", ns = %namespace, %name);
        let result = self.pass(namespace, name).instrument(span).await;
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        match &result {
            Ok(outcome) => debug!(%namespace, %name, ?outcome, "pass finished"),
            Err(e) => {
                counter!("reconcile_errors_total", 1u64);
                warn!(%namespace, %name, error = %e, "pass failed");
            }
        }
        result
    }

    /// Compute what a pass would change, without creating routes, image tags
    /// or any resource.
    pub async fn plan(&self, namespace: &str, name: &str) -> Result<Plan, ReconcileError> {
        let span = info_span!("plan", ns = %namespace, %name);
        self.dry_pass(namespace, name).instrument(span).await
    }

    async fn dry_pass(&self, namespace: &str, name: &str) -> Result<Plan, ReconcileError> {
        let mut app = self.client.get_app(namespace, name).await?;
        let mut env = self.compiler.compile(&mut app)?;
        let requested_routes = routes::requested_routes(&env, &app);
        let deployed_routes = routes::load_routes(self.client.as_ref(), &requested_routes).await?;
        let missing_routes = routes::missing_routes(&requested_routes, &deployed_routes).iter().map(|r| r.key()).collect();
        env = routes::set_hosts_and_certs(self.compiler.as_ref(), &mut app, env, &deployed_routes)?;
        let resolver = ImageResolver::dry_run(self.client.as_ref(), &self.settings);
        let requested = self.requested_resources(&resolver, &mut env, &app).await;
        let deployed = build_inventory(self.client.as_ref(), app.uid(), namespace, &secret_names(&requested)).await?;
        Ok(Plan { missing_routes, deltas: self.comparator.compare(&deployed, &requested) })
    }

    async fn pass(&self, namespace: &str, name: &str) -> Result<Outcome, ReconcileError> {
        let Desired { mut app, env, requested } = match self.render(namespace, name).await? {
            Rendered::Ready(d) => d,
            Rendered::Gone => return Ok(Outcome::Done),
            Rendered::RoutesPending { app, missing } => {
                info!(count = missing.len(), "creating missing routes");
                match add_resources(self.client.as_ref(), &app, &missing).await {
                    Ok(true) => return Ok(Outcome::RequeueAfter(self.settings.route_wait)),
                    Ok(false) => return Ok(Outcome::Requeue),
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let deployed = match build_inventory(self.client.as_ref(), app.uid(), namespace, &secret_names(&requested)).await {
            Ok(d) => d,
            Err(e) => {
                self.record_failure(&mut app, ReasonType::Unknown, &e.to_string()).await;
                return Err(e.into());
            }
        };
        let dcs = deployed.get(&Kind::DeploymentConfig).map(Vec::as_slice).unwrap_or_default();
        status::set_deployments(&mut app, status::deployment_summary(dcs));

        let deltas = self.comparator.compare(&deployed, &requested);
        let mut has_updates = false;
        for (kind, delta) in deltas.iter().filter(|(_, d)| d.has_changes()) {
            let s = delta.summary();
            debug!(%kind, adds = s.adds, updates = s.updates, removes = s.removes, "applying delta");
            let live = deployed.get(kind).map(Vec::as_slice).unwrap_or_default();
            match apply_delta(self.client.as_ref(), &app, live, delta).await {
                Ok(changed) => has_updates |= changed,
                Err(e) if e.source.is_conflict() => {
                    info!(error = %e, "stale object during apply, requeueing");
                    return Ok(Outcome::Requeue);
                }
                Err(e) => return Err(e.into()),
            }
        }
        if has_updates && status::set_provisioning(&mut app) {
            return self.persist(&app).await;
        }

        self.reconcile_config_artifacts().await;
        let detached = orphans::detach_orphaned_worker_configs(self.client.as_ref(), namespace, &env).await;
        if detached > 0 {
            info!(detached, "detached server config maps");
        }

        let cached = match self.client.get_app_cached(namespace, name).await {
            Ok(c) => c,
            Err(e) if e.is_not_found() => return Ok(Outcome::Done),
            Err(e) => {
                self.record_failure(&mut app, ReasonType::Unknown, &e.to_string()).await;
                return Err(e.into());
            }
        };
        let fresh = app.resource_version() == cached.resource_version();
        if app.spec != cached.spec {
            if status::set_provisioning(&mut app) && fresh {
                return self.persist(&app).await;
            }
            return Ok(Outcome::Requeue);
        }
        if app.status != cached.status {
            return if fresh { self.persist(&app).await } else { Ok(Outcome::Requeue) };
        }
        if status::set_deployed(&mut app) {
            return if fresh { self.persist(&app).await } else { Ok(Outcome::Requeue) };
        }
        Ok(Outcome::Done)
    }

    /// Read the instance and render everything it should own. Stops early
    /// with the routes to create when some do not exist yet.
    async fn render(&self, namespace: &str, name: &str) -> Result<Rendered, ReconcileError> {
        let mut app = match self.client.get_app(namespace, name).await {
            Ok(app) => app,
            Err(e) if e.is_not_found() => {
                debug!("instance is gone");
                return Ok(Rendered::Gone);
            }
            Err(e) => return Err(e.into()),
        };

        let mut env = match self.compiler.compile(&mut app) {
            Ok(env) => env,
            Err(e) => {
                self.record_failure(&mut app, ReasonType::ConfigurationError, &e.to_string()).await;
                return Err(e.into());
            }
        };

        let requested_routes = routes::requested_routes(&env, &app);
        let deployed_routes = routes::load_routes(self.client.as_ref(), &requested_routes).await?;
        if deployed_routes.len() < requested_routes.len() {
            let missing = routes::missing_routes(&requested_routes, &deployed_routes);
            return Ok(Rendered::RoutesPending { app, missing });
        }

        env = routes::set_hosts_and_certs(self.compiler.as_ref(), &mut app, env, &deployed_routes)?;
        let resolver = ImageResolver::new(self.client.as_ref(), &self.settings);
        let requested = self.requested_resources(&resolver, &mut env, &app).await;
        Ok(Rendered::Ready(Desired { app, env, requested }))
    }

    /// Resources of every non-omitted component, images resolved and bound
    /// to the instance's namespace.
    async fn requested_resources(&self, resolver: &ImageResolver<'_>, env: &mut Environment, app: &KieApp) -> ResourceMap {
        for component in env.components_mut().filter(|c| !c.omit) {
            resolver.resolve_component(component, app).await;
        }
        let ns = app.namespace_or_default();
        group_by_kind(env.resources().into_iter().map(|mut r| {
            r.set_namespace(ns);
            r
        }))
    }

    async fn reconcile_config_artifacts(&self) {
        let Some((ns, name)) = self.settings.operator_deployment() else { return };
        match self.client.get(Kind::Deployment, ns, name).await {
            Ok(operator) => {
                let generated = self.compiler.config_artifacts(&operator);
                let stats = artifacts::reconcile_artifacts(self.client.as_ref(), &generated).await;
                debug!(created = stats.created, backups = stats.backups_created + stats.backups_updated, "config artifacts reconciled");
            }
            Err(e) => warn!(%ns, %name, error = %e, "can't read operator deployment, skipping config artifacts"),
        }
    }

    /// Versioned write of the instance; a lost race is a requeue.
    async fn persist(&self, app: &KieApp) -> Result<Outcome, ReconcileError> {
        info!(name = %app.metadata.name.as_deref().unwrap_or_default(), "updating instance");
        match self.client.update_app(app).await {
            Ok(_) => Ok(Outcome::Requeue),
            Err(e) if e.is_conflict() => {
                info!(error = %e, "instance changed concurrently, requeueing");
                Ok(Outcome::Requeue)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mark the instance failed and try to persist that; a failing write is only logged.
    async fn record_failure(&self, app: &mut KieApp, reason: ReasonType, message: &str) {
        if !status::set_failed(app, reason, message) {
            return;
        }
        if let Err(e) = self.client.update_app(app).await {
            warn!(error = %e, "unable to record failed status");
        }
    }
}
