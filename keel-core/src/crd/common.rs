//! Types shared by the Keel CRDs.

use std::collections::BTreeMap;

use anyhow::{ensure, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The value of a condition which holds.
pub const CONDITION_TRUE: &str = "True";
/// The value of a condition which does not hold.
pub const CONDITION_FALSE: &str = "False";
/// The largest replica count of a component, bounded by the platform's signed 32-bit counts.
pub const MAX_REPLICAS: u32 = i32::MAX as u32;

/// Check that a replica count is positive & representable by the platform.
pub fn validate_replicas(replicas: u32) -> Result<()> {
    ensure!(
        (1..=MAX_REPLICAS).contains(&replicas),
        "replicas must be between 1 and {}, got {}",
        MAX_REPLICAS,
        replicas
    );
    Ok(())
}

/// The storage used by the pods of a stateful component.
///
/// Only the `deleteClaim` flag of a persistent claim may be changed once a cluster has been
/// created. Any other change is rejected by the operator and surfaced as a condition.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StorageSpec {
    /// Data lives in an `emptyDir` volume and is lost along with the pod.
    Ephemeral,
    /// Data lives in a persistent volume claim per pod.
    #[serde(rename_all = "camelCase")]
    PersistentClaim {
        /// The requested volume size, e.g. `100Gi`.
        size: String,
        /// The storage class of the claims.
        #[serde(default)]
        class: Option<String>,
        /// Labels used to select pre-provisioned volumes.
        #[serde(default)]
        selector: Option<BTreeMap<String, String>>,
        /// Delete the claims when the cluster is deleted.
        #[serde(default)]
        delete_claim: bool,
    },
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self::Ephemeral
    }
}

impl StorageSpec {
    /// Check that this storage spec is usable.
    pub fn validate(&self) -> Result<()> {
        if let Self::PersistentClaim { size, .. } = self {
            ensure!(!size.trim().is_empty(), "persistent-claim storage requires a non-empty size");
        }
        Ok(())
    }

    /// Whether claims are to be deleted along with the cluster.
    pub fn delete_claim(&self) -> bool {
        match self {
            Self::Ephemeral => false,
            Self::PersistentClaim { delete_claim, .. } => *delete_claim,
        }
    }
}

/// Timing of the readiness & liveness probes of a component.
///
/// Unset values fall back to defaults specific to the component kind.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    /// Seconds to wait after container start before probing.
    #[serde(default)]
    pub initial_delay_seconds: Option<i32>,
    /// Seconds after which a probe times out.
    #[serde(default)]
    pub timeout_seconds: Option<i32>,
}

/// CRD status object shared by all Keel CRDs.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// The latest observed conditions of the cluster's components.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A status condition.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// The type of the condition, e.g. `KafkaReady`.
    #[serde(rename = "type")]
    pub type_: String,
    /// One of `True`, `False` or `Unknown`.
    pub status: String,
    /// A machine readable reason for the condition's last transition.
    #[serde(default)]
    pub reason: Option<String>,
    /// A human readable message for the condition's last transition.
    #[serde(default)]
    pub message: Option<String>,
    /// RFC 3339 timestamp of the last change of `status`.
    #[serde(default)]
    pub last_transition_time: Option<String>,
}

impl Condition {
    /// Construct a new condition, stamped with the given transition time.
    pub fn new(type_: impl Into<String>, holds: bool, reason: impl Into<String>, message: impl Into<String>, now: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: if holds { CONDITION_TRUE } else { CONDITION_FALSE }.into(),
            reason: Some(reason.into()),
            message: Some(message.into()),
            last_transition_time: Some(now.into()),
        }
    }
}

impl ClusterStatus {
    /// Insert or replace the condition of the same type, returning `true` if anything changed.
    ///
    /// The previous transition time is kept when the condition's status did not change.
    pub fn upsert_condition(&mut self, mut condition: Condition) -> bool {
        match self.conditions.iter_mut().find(|existing| existing.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time.clone();
                }
                if existing == &condition {
                    return false;
                }
                *existing = condition;
                true
            }
            None => {
                self.conditions.push(condition);
                true
            }
        }
    }

    /// Find the condition of the given type.
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|cond| cond.type_ == type_)
    }
}
