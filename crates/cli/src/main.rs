use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, warn};

use kieop_apply::summarize;
use kieop_core::KieApp;
use kieop_kubehub::KubeClient;
use kieop_reconcile::{EnvironmentFileCompiler, OperatorSettings, Outcome, ReconcileError, Reconciler};

/// Delay before retrying an instance whose pass failed.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "kieopctl", version, about = "KieApp reconciler")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace of the instance (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Pre-rendered environment (YAML) served as the template compiler output
    #[arg(long = "env-file", global = true, env = "KIEOP_ENV_FILE")]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile one instance until it settles
    Reconcile {
        name: String,
        /// Give up after this many passes
        #[arg(long = "max-passes", default_value_t = 20)]
        max_passes: usize,
    },
    /// Run the controller over every KieApp in the namespace (all namespaces without --ns)
    Run,
    /// Show what a pass would create, update and remove
    Diff { name: String },
}

fn init_tracing() {
    let env = std::env::var("KIEOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KIEOP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KIEOP_METRICS_ADDR; expected host:port");
        }
    }
}

fn outcome_label(o: &Outcome) -> String {
    match o {
        Outcome::Done => "done".to_string(),
        Outcome::Requeue => "requeue".to_string(),
        Outcome::RequeueAfter(d) => format!("requeue after {}ms", d.as_millis()),
    }
}

async fn reconcile_app(app: Arc<KieApp>, ctx: Arc<Reconciler>) -> Result<Action, ReconcileError> {
    let ns = app.namespace().unwrap_or_else(|| "default".to_string());
    let name = app.name_any();
    Ok(match ctx.reconcile(&ns, &name).await? {
        Outcome::Done => Action::await_change(),
        Outcome::Requeue => Action::requeue(Duration::ZERO),
        Outcome::RequeueAfter(d) => Action::requeue(d),
    })
}

fn error_policy(app: Arc<KieApp>, err: &ReconcileError, _ctx: Arc<Reconciler>) -> Action {
    warn!(name = %app.name_any(), error = %err, "reconcile failed, backing off");
    Action::requeue(ERROR_BACKOFF)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let env_file = cli.env_file.clone().ok_or_else(|| anyhow!("--env-file is required"))?;
    let compiler = Arc::new(EnvironmentFileCompiler::from_path(&env_file)?);
    let kube = KubeClient::try_default().await?;
    let inner = kube.inner().clone();
    let settings = OperatorSettings::from_env();
    debug!(?settings, "operator settings");
    let reconciler = Reconciler::new(Arc::new(kube), compiler, settings);

    match cli.command {
        Commands::Reconcile { name, max_passes } => {
            let ns = cli.namespace.clone().unwrap_or_else(|| inner.default_namespace().to_string());
            info!(%ns, %name, "reconcile invoked");
            let mut outcomes = Vec::new();
            for _ in 0..max_passes {
                let outcome = reconciler.reconcile(&ns, &name).await?;
                if cli.output == Output::Human {
                    println!("pass {}: {}", outcomes.len() + 1, outcome_label(&outcome));
                }
                outcomes.push(outcome_label(&outcome));
                match outcome {
                    Outcome::Done => break,
                    Outcome::Requeue => {}
                    Outcome::RequeueAfter(d) => tokio::time::sleep(d).await,
                }
            }
            if cli.output == Output::Json {
                println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "namespace": ns, "name": name, "passes": outcomes }))?);
            }
            if outcomes.last().map(String::as_str) != Some("done") {
                warn!(max_passes, "instance did not settle");
            }
        }
        Commands::Run => {
            let api: Api<KieApp> = match cli.namespace.as_deref() {
                Some(ns) => Api::namespaced(inner.clone(), ns),
                None => Api::all(inner.clone()),
            };
            info!(ns = ?cli.namespace, "controller starting");
            Controller::new(api, watcher::Config::default())
                .shutdown_on_signal()
                .run(reconcile_app, error_policy, Arc::new(reconciler))
                .for_each(|res| async move {
                    match res {
                        Ok((obj, action)) => debug!(name = %obj.name, ?action, "reconciled"),
                        Err(e) => error!(error = %e, "controller error"),
                    }
                })
                .await;
            info!("controller stopped");
        }
        Commands::Diff { name } => {
            let ns = cli.namespace.clone().unwrap_or_else(|| inner.default_namespace().to_string());
            info!(%ns, %name, "diff invoked");
            let plan = reconciler.plan(&ns, &name).await?;
            match cli.output {
                Output::Human => {
                    for key in &plan.missing_routes {
                        println!("missing route {}", key);
                    }
                    println!("KIND                   ADD  UPD  DEL");
                    for (kind, delta) in plan.deltas.iter().filter(|(_, d)| d.has_changes()) {
                        let s = delta.summary();
                        println!("{:<22} {:>4} {:>4} {:>4}", kind, s.adds, s.updates, s.removes);
                    }
                    let total = summarize(&plan.deltas);
                    if total.is_empty() {
                        println!("(in sync)");
                    }
                }
                Output::Json => {
                    let kinds: serde_json::Map<String, serde_json::Value> = plan
                        .deltas
                        .iter()
                        .filter(|(_, d)| d.has_changes())
                        .map(|(kind, d)| {
                            let names = |rs: &[kieop_core::Resource]| rs.iter().map(|r| r.name().to_string()).collect::<Vec<_>>();
                            (
                                kind.to_string(),
                                serde_json::json!({ "added": names(&d.added), "updated": names(&d.updated), "removed": names(&d.removed) }),
                            )
                        })
                        .collect();
                    let missing: Vec<String> = plan.missing_routes.iter().map(|k| k.to_string()).collect();
                    println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "missingRoutes": missing, "kinds": kinds }))?);
                }
            }
        }
    }
    Ok(())
}
