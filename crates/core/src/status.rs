//! Status conditions of a `KieApp` and the transitions between them.
//!
//! `Provisioning`, `Deployed` and `Failed` are independent boolean facts, not
//! one exclusive phase. Every mutator reports whether it changed anything so
//! the caller only persists the instance when there is something to write.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::{Deployments, KieApp, KieAppStatus};
use crate::Resource;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionType {
    Provisioning,
    Deployed,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReasonType {
    /// The template compiler rejected the declared intent.
    ConfigurationError,
    DeploymentFailed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub last_transition_time: Time,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    fn new(type_: ConditionType, status: ConditionStatus) -> Self {
        Self { type_, status, last_transition_time: Time(chrono::Utc::now()), reason: None, message: None }
    }
}

fn condition_idx(status: &KieAppStatus, type_: ConditionType) -> Option<usize> {
    status.conditions.iter().position(|c| c.type_ == type_)
}

pub fn find_condition(cr: &KieApp, type_: ConditionType) -> Option<&Condition> {
    cr.conditions().iter().find(|c| c.type_ == type_)
}

/// Mark a convergence pass as in progress. No-op when already provisioning;
/// otherwise appends `Provisioning=True` and forces `Deployed=False`.
/// Earlier failures stay until the next successful deploy.
pub fn set_provisioning(cr: &mut KieApp) -> bool {
    let name = cr.metadata.name.clone().unwrap_or_default();
    let status = cr.status_mut();
    if condition_idx(status, ConditionType::Provisioning).is_some() {
        debug!(%name, "status: unchanged [provisioning]");
        return false;
    }
    debug!(%name, "status: set provisioning");
    status.conditions.push(Condition::new(ConditionType::Provisioning, ConditionStatus::True));
    set_deployed_flag(status, false);
    true
}

/// Mark the instance deployed. A transition into `Deployed=True` clears
/// the whole condition history first.
pub fn set_deployed(cr: &mut KieApp) -> bool {
    let changed = set_deployed_flag(cr.status_mut(), true);
    debug!(name = %cr.metadata.name.as_deref().unwrap_or_default(), changed, "status: deployed");
    changed
}

/// Force `Deployed=False` and upsert `Failed=True` with the latest reason/message.
pub fn set_failed(cr: &mut KieApp, reason: ReasonType, message: &str) -> bool {
    debug!(name = %cr.metadata.name.as_deref().unwrap_or_default(), ?reason, %message, "status: set failed");
    let status = cr.status_mut();
    let mut changed = set_deployed_flag(status, false);
    let mut condition = Condition::new(ConditionType::Failed, ConditionStatus::True);
    condition.reason = Some(reason);
    condition.message = Some(message.to_string());
    match condition_idx(status, ConditionType::Failed) {
        Some(i) => {
            let prev = &status.conditions[i];
            if prev.status != ConditionStatus::True || prev.reason != condition.reason || prev.message != condition.message {
                status.conditions[i] = condition;
                changed = true;
            }
        }
        None => {
            status.conditions.push(condition);
            changed = true;
        }
    }
    changed
}

/// Replace the deployment summary.
pub fn set_deployments(cr: &mut KieApp, deployments: Deployments) {
    cr.status_mut().deployments = deployments;
}

/// Classify deployment configs: stopped when scaled to zero, starting while
/// fewer replicas are ready than desired, ready otherwise.
pub fn deployment_summary(dcs: &[Resource]) -> Deployments {
    let mut out = Deployments::default();
    for dc in dcs {
        let desired = dc.deployment_config_spec().map(|s| s.replicas).unwrap_or_default();
        let ready = dc.deployment_config_status().ready_replicas;
        let name = dc.name().to_string();
        if desired == 0 {
            out.stopped.push(name);
        } else if ready < desired {
            out.starting.push(name);
        } else {
            out.ready.push(name);
        }
    }
    out.ready.sort();
    out.starting.sort();
    out.stopped.sort();
    out
}

fn set_deployed_flag(status: &mut KieAppStatus, deployed: bool) -> bool {
    let value = if deployed { ConditionStatus::True } else { ConditionStatus::False };
    let idx = condition_idx(status, ConditionType::Deployed);
    if let Some(i) = idx {
        if status.conditions[i].status == value {
            return false;
        }
    }
    let condition = Condition::new(ConditionType::Deployed, value);
    match (deployed, idx) {
        (true, _) => {
            status.conditions.clear();
            status.conditions.push(condition);
        }
        (false, Some(i)) => status.conditions[i] = condition,
        (false, None) => status.conditions.push(condition),
    }
    true
}
