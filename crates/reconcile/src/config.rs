//! Operator settings read once from the environment.

use std::time::Duration;

use kieop_core::app::DEFAULT_IMAGE_REGISTRY;

/// Delay before re-running a pass that just created routes.
pub const DEFAULT_ROUTE_WAIT_MS: u64 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSettings {
    /// Registry host for locally tracked image tags (`REGISTRY`).
    pub registry: String,
    /// Mark created image tags insecure (`INSECURE`).
    pub insecure: bool,
    /// The operator's own Deployment (`OPERATOR_NAME`, `OPERATOR_NAMESPACE`).
    /// Config artifacts are only reconciled when both are known.
    pub operator_name: Option<String>,
    pub operator_namespace: Option<String>,
    pub route_wait: Duration,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            registry: DEFAULT_IMAGE_REGISTRY.to_string(),
            insecure: false,
            operator_name: None,
            operator_namespace: None,
            route_wait: Duration::from_millis(DEFAULT_ROUTE_WAIT_MS),
        }
    }
}

impl OperatorSettings {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();
        Self {
            registry: non_empty("REGISTRY").unwrap_or(defaults.registry),
            insecure: non_empty("INSECURE").map(|v| parse_bool(&v)).unwrap_or(false),
            operator_name: non_empty("OPERATOR_NAME"),
            operator_namespace: non_empty("OPERATOR_NAMESPACE"),
            route_wait: non_empty("KIEOP_ROUTE_WAIT_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.route_wait),
        }
    }

    /// `(namespace, name)` of the operator Deployment when both are configured.
    pub fn operator_deployment(&self) -> Option<(&str, &str)> {
        Some((self.operator_namespace.as_deref()?, self.operator_name.as_deref()?))
    }
}

fn parse_bool(v: &str) -> bool { matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on") }

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> OperatorSettings {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        OperatorSettings::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let s = settings(&[]);
        assert_eq!(s, OperatorSettings::default());
        assert_eq!(s.registry, "registry.redhat.io");
        assert_eq!(s.route_wait, Duration::from_millis(200));
        assert!(s.operator_deployment().is_none());
    }

    #[test]
    fn reads_overrides() {
        let s = settings(&[
            ("REGISTRY", "quay.example.com"),
            ("INSECURE", "True"),
            ("OPERATOR_NAME", "kie-operator"),
            ("OPERATOR_NAMESPACE", "ops"),
            ("KIEOP_ROUTE_WAIT_MS", "50"),
        ]);
        assert_eq!(s.registry, "quay.example.com");
        assert!(s.insecure);
        assert_eq!(s.operator_deployment(), Some(("ops", "kie-operator")));
        assert_eq!(s.route_wait, Duration::from_millis(50));
    }

    #[test]
    fn blank_and_garbage_fall_back() {
        let s = settings(&[("REGISTRY", "  "), ("INSECURE", "nope"), ("KIEOP_ROUTE_WAIT_MS", "soon"), ("OPERATOR_NAME", "x")]);
        assert_eq!(s.registry, "registry.redhat.io");
        assert!(!s.insecure);
        assert_eq!(s.route_wait, Duration::from_millis(200));
        assert!(s.operator_deployment().is_none());
    }
}
