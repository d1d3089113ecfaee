//! Route/TLS provisioner: find which requested routes exist, and derive
//! certificate names and external URLs from the hosts the router assigned.

use std::collections::HashMap;

use serde_json::json;
use tracing::{debug, info};

use kieop_core::{KieApp, Kind, Resource, ResourceKey};
use kieop_kubehub::{ClientError, ClusterClient};
use kieop_pki::{generate_keystore, PkiError};

use crate::compiler::{Component, ComponentRole, Environment, TemplateCompiler};

pub const KEYSTORE_KEY: &str = "keystore.jks";
pub const KEYSTORE_ALIAS: &str = "jboss";

/// Deployed routes keyed by identity, carrying their assigned hosts.
pub type RouteHosts = HashMap<ResourceKey, Resource>;

/// Routes of every non-omitted component, bound to the instance's namespace.
pub fn requested_routes(env: &Environment, app: &KieApp) -> Vec<Resource> {
    let ns = app.namespace_or_default();
    env.active()
        .flat_map(|c| c.routes())
        .cloned()
        .map(|mut r| {
            r.set_namespace(ns);
            r
        })
        .collect()
}

/// Fetch each requested route; absent ones are simply left out of the map.
pub async fn load_routes(client: &dyn ClusterClient, requested: &[Resource]) -> Result<RouteHosts, ClientError> {
    let mut out = RouteHosts::new();
    for r in requested {
        if let Some(live) = client.get_opt(Kind::Route, r.namespace(), r.name()).await? {
            out.insert(r.key(), live);
        }
    }
    Ok(out)
}

pub fn missing_routes(requested: &[Resource], deployed: &RouteHosts) -> Vec<Resource> {
    requested.iter().filter(|r| !deployed.contains_key(&r.key())).cloned().collect()
}

/// Assigned host of the first TLS route of `component`, if the router has
/// assigned one yet.
fn tls_host(component: &Component, routes: &RouteHosts, namespace: &str) -> Option<String> {
    let route = component.routes().find(|r| r.route_has_tls())?;
    let key = ResourceKey::new(Kind::Route, namespace, route.name());
    routes.get(&key).map(|live| live.route_host()).filter(|h| !h.is_empty())
}

/// Secret named `<component>-app-secret` holding a fresh keystore for `cn`.
pub fn keystore_secret(component: &str, cn: &str, app: &KieApp) -> Result<Resource, PkiError> {
    let keystore = generate_keystore(cn, KEYSTORE_ALIAS, &app.spec.common_config.key_store_password)?;
    let mut secret = Resource::new(Kind::Secret, &format!("{}-app-secret", component));
    secret.set_label("app", app.application_name());
    secret.set_label("application", app.application_name());
    secret.set_field("type", json!("Opaque"));
    secret.set_field("data", json!({ KEYSTORE_KEY: base64_encode(&keystore) }));
    Ok(secret)
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Resolve each component's certificate name, record its external URL on
/// the instance status and add a generated keystore secret where none was
/// supplied. Omitted components are skipped; components in `others` take
/// part only when they expose routes.
pub fn set_hosts_and_certs(
    compiler: &dyn TemplateCompiler,
    app: &mut KieApp,
    mut env: Environment,
    routes: &RouteHosts,
) -> Result<Environment, PkiError> {
    let ns = app.namespace_or_default().to_string();
    let app_name = app.application_name().to_string();
    for component in env.components_mut() {
        if component.omit {
            continue;
        }
        if component.role == ComponentRole::Other && component.routes().next().is_none() {
            continue;
        }
        let (cn, url) = match tls_host(component, routes, &ns) {
            Some(host) => (host.clone(), format!("https://{}", host)),
            None => (app_name.clone(), format!("http://{}", app_name)),
        };
        debug!(component = %component.name, %cn, "resolved certificate name");
        let status = app.status_mut();
        match component.role {
            ComponentRole::Console => status.console_host = url,
            _ => {
                status.component_hosts.insert(component.name.clone(), url);
            }
        }
        compiler.configure_hostname(component, app, &cn);
        if component.keystore_secret.is_none() {
            info!(component = %component.name, %cn, "generating keystore");
            let secret = keystore_secret(&component.name, &cn, app)?;
            component.resources.push(secret);
        }
    }
    Ok(compiler.finalize(env, app))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kieop_core::KieAppSpec;
    use kieop_kubehub::InMemoryClient;

    struct Plain;
    impl TemplateCompiler for Plain {
        fn compile(&self, _app: &mut KieApp) -> Result<Environment, crate::compiler::CompileError> { Ok(Environment::default()) }
    }

    fn app() -> KieApp {
        let mut spec = KieAppSpec::default();
        spec.common_config.application_name = "myapp".into();
        spec.common_config.key_store_password = "pw".into();
        let mut a = KieApp::new("myapp", spec);
        a.metadata.namespace = Some("ns".into());
        a
    }

    fn route(name: &str, tls: bool) -> Resource {
        let mut r = Resource::new(Kind::Route, name);
        if tls {
            r.set_field("spec", json!({ "tls": { "termination": "passthrough" } }));
        } else {
            r.set_field("spec", json!({ "to": { "name": name } }));
        }
        r
    }

    fn env() -> Environment {
        let mut console = Component::new(ComponentRole::Console, "myapp-rhpamcentr");
        console.resources = vec![route("console-http", false), route("console", true)];
        let mut server = Component::new(ComponentRole::Server, "myapp-kieserver");
        server.resources = vec![route("server", false)];
        let mut router = Component::new(ComponentRole::SmartRouter, "myapp-smartrouter");
        router.omit = true;
        router.resources = vec![route("router", true)];
        let mut amq = Component::new(ComponentRole::Other, "myapp-amq");
        amq.resources = vec![route("amq", false)];
        Environment {
            console,
            servers: vec![server],
            smart_router: router,
            others: vec![amq, Component::new(ComponentRole::Other, "db")],
        }
    }

    #[test]
    fn requested_routes_skip_omitted() {
        let routes = requested_routes(&env(), &app());
        let names: Vec<_> = routes.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["console-http", "console", "server", "amq"]);
        assert!(routes.iter().all(|r| r.namespace() == "ns"));
    }

    #[tokio::test]
    async fn missing_routes_are_those_not_found() {
        let client = InMemoryClient::new();
        let requested = requested_routes(&env(), &app());
        client.seed(requested[0].clone()).unwrap();
        let deployed = load_routes(&client, &requested).await.unwrap();
        assert_eq!(deployed.len(), 1);
        let missing = missing_routes(&requested, &deployed);
        assert_eq!(missing.iter().map(|r| r.name()).collect::<Vec<_>>(), vec!["console", "server", "amq"]);
    }

    #[test]
    fn tls_route_host_becomes_https_url() {
        let mut a = app();
        let mut live = route("console", true);
        live.set_namespace("ns");
        live.set_field("spec", json!({ "host": "console.apps.example.com", "tls": { "termination": "passthrough" } }));
        let routes: RouteHosts = [(live.key(), live)].into_iter().collect();

        let out = set_hosts_and_certs(&Plain, &mut a, env(), &routes).unwrap();
        let status = a.status.as_ref().unwrap();
        assert_eq!(status.console_host, "https://console.apps.example.com");
        assert_eq!(status.component_hosts["myapp-kieserver"], "http://myapp");
        assert!(!status.component_hosts.contains_key("myapp-smartrouter"));
        assert_eq!(status.component_hosts["myapp-amq"], "http://myapp");
        assert!(!status.component_hosts.contains_key("db"));

        let secret = out.console.of_kind(Kind::Secret).next().unwrap();
        assert_eq!(secret.name(), "myapp-rhpamcentr-app-secret");
        assert_eq!(secret.label("application"), Some("myapp"));
        assert!(secret.field("data").unwrap().get(KEYSTORE_KEY).is_some());
        assert_eq!(out.servers[0].of_kind(Kind::Secret).count(), 1);
        assert_eq!(out.others[0].of_kind(Kind::Secret).count(), 1);
        // Omitted and route-less components get nothing.
        assert_eq!(out.smart_router.of_kind(Kind::Secret).count(), 0);
        assert_eq!(out.others[1].of_kind(Kind::Secret).count(), 0);
    }

    #[test]
    fn unknown_host_falls_back_to_application_name() {
        let mut a = app();
        set_hosts_and_certs(&Plain, &mut a, env(), &RouteHosts::new()).unwrap();
        assert_eq!(a.status.unwrap().console_host, "http://myapp");
    }

    #[test]
    fn supplied_keystore_is_not_generated() {
        let mut a = app();
        let mut e = env();
        e.console.keystore_secret = Some("own".into());
        let out = set_hosts_and_certs(&Plain, &mut a, e, &RouteHosts::new()).unwrap();
        assert_eq!(out.console.of_kind(Kind::Secret).count(), 0);
    }
}
