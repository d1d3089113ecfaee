//! Image reference resolver: make sure every external image a build or
//! deployment references has a locally tracked image tag.

use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use kieop_core::app::DEFAULT_IMAGE_REGISTRY;
use kieop_core::openshift::{TagImportPolicy, TagReference, TagReferencePolicy};
use kieop_core::{KieApp, Kind, Resource};
use kieop_kubehub::{ClientError, ClusterClient};

use crate::compiler::Component;
use crate::config::OperatorSettings;

static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new("[0-9]+").expect("digit pattern"));

/// `repository[:tag]` split, the tag defaulting to `latest`.
pub fn split_image_ref(image: &str) -> (&str, &str) {
    match image.split_once(':') {
        Some((repo, tag)) if !tag.is_empty() => (repo, tag),
        Some((repo, _)) => (repo, "latest"),
        None => (image, "latest"),
    }
}

/// Remote reference a new local tag points at: `<registry>/<context>/<image>`.
///
/// Known repository families live under fixed contexts of the default
/// registry; everything else uses `<product>-<major>` of the instance's
/// registry (or the operator default).
pub fn registry_url(app: &KieApp, settings: &OperatorSettings, repo: &str, tag: &str) -> String {
    let registry = app.registry(&settings.registry, settings.insecure);
    let mut address = registry.registry;
    let mut context = format!("{}-{}", app.product(), app.major_version());
    let mut image = format!("{}:{}", repo, tag);
    if repo.contains("datagrid") {
        address = DEFAULT_IMAGE_REGISTRY.to_string();
        context = "jboss-datagrid-7".to_string();
    } else if repo.contains("amq-broker-7") {
        address = DEFAULT_IMAGE_REGISTRY.to_string();
        context = if repo.contains("scaledown") { "amq-broker-7-tech-preview" } else { "amq-broker-7" }.to_string();
    } else if repo == "postgresql" || repo == "mysql" {
        address = DEFAULT_IMAGE_REGISTRY.to_string();
        context = "rhscl".to_string();
        let digits: String = DIGITS.find_iter(tag).map(|m| m.as_str()).collect();
        image = format!("{}-{}-rhel7:latest", repo, digits);
    }
    format!("{}/{}/{}", address, context, image)
}

/// ImageStreamTag `repo:tag` in the instance namespace tracking `url`.
pub fn local_tag(app: &KieApp, settings: &OperatorSettings, repo: &str, tag: &str) -> Resource {
    let url = registry_url(app, settings, repo, tag);
    let insecure = app.registry(&settings.registry, settings.insecure).insecure;
    let reference = TagReference {
        name: tag.to_string(),
        from: Some(k8s_openapi::api::core::v1::ObjectReference {
            kind: Some("DockerImage".into()),
            name: Some(url),
            ..Default::default()
        }),
        reference_policy: Some(TagReferencePolicy { type_: "Local".into() }),
        import_policy: insecure.then_some(TagImportPolicy { insecure: true }),
    };
    let mut r = Resource::new(Kind::ImageStreamTag, &format!("{}:{}", repo, tag));
    r.set_namespace(app.namespace_or_default());
    r.set_field("tag", serde_json::to_value(reference).unwrap_or_else(|_| json!({})));
    r
}

pub struct ImageResolver<'a> {
    client: &'a dyn ClusterClient,
    settings: &'a OperatorSettings,
    /// When false, missing tags are reported as if created but nothing is written.
    create: bool,
}

impl<'a> ImageResolver<'a> {
    pub fn new(client: &'a dyn ClusterClient, settings: &'a OperatorSettings) -> Self { Self { client, settings, create: true } }

    pub fn dry_run(client: &'a dyn ClusterClient, settings: &'a OperatorSettings) -> Self {
        Self { client, settings, create: false }
    }

    /// Probe errors other than absence are logged and treated as absence.
    async fn tag_exists(&self, namespace: &str, name: &str) -> bool {
        if namespace.is_empty() {
            return false;
        }
        match self.client.get(Kind::ImageStreamTag, namespace, name).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                debug!(%namespace, %name, error = %e, "image tag probe failed");
                false
            }
        }
    }

    /// Namespace holding a tag for `image`: `fallback_ns` then the instance
    /// namespace (only the latter with a custom registry), creating the tag in
    /// the instance namespace when neither has it. Repeated calls for the
    /// same image write nothing once the tag exists.
    pub async fn ensure_local_tag(&self, image: &str, fallback_ns: &str, app: &KieApp) -> Result<String, ClientError> {
        let (repo, tag) = split_image_ref(image);
        let tag_name = format!("{}:{}", repo, tag);
        let own_ns = app.namespace_or_default();
        let candidates: Vec<&str> =
            if app.spec.image_registry.is_some() { vec![own_ns] } else { vec![fallback_ns, own_ns] };
        for ns in candidates {
            if self.tag_exists(ns, &tag_name).await {
                return Ok(ns.to_string());
            }
        }
        warn!(namespace = %fallback_ns, name = %tag_name, "image tag doesn't exist");
        if !self.create {
            return Ok(own_ns.to_string());
        }
        let local = local_tag(app, self.settings, repo, tag);
        info!(name = %tag_name, namespace = %own_ns, from = %registry_url(app, self.settings, repo, tag), "creating image tag");
        match self.client.create(&local).await {
            Ok(_) => counter!("image_tags_created_total", 1u64),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
        Ok(own_ns.to_string())
    }

    /// Point the component's image references at resolved namespaces:
    /// deployment-config image triggers (only when the component builds
    /// nothing itself) and Source-strategy build configs. Failures keep the
    /// original namespace.
    pub async fn resolve_component(&self, component: &mut Component, app: &KieApp) {
        let builds = component.of_kind(Kind::BuildConfig).next().is_some();
        for r in component.resources.iter_mut() {
            match r.kind {
                Kind::DeploymentConfig if !builds => {}
                Kind::BuildConfig => {}
                _ => continue,
            }
            for image in r.image_refs() {
                match self.ensure_local_tag(&image.name, &image.namespace, app).await {
                    Ok(ns) => {
                        r.set_image_namespace(&image.namespace_pointer, &ns);
                    }
                    Err(e) => warn!(kind = %r.kind, name = %r.name(), image = %image.name, error = %e, "image resolution failed"),
                }
            }
        }
    }
}
