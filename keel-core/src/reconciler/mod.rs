//! Reconcilers for the supported resource kinds.
//!
//! Each reconciler looks the named resource up, compares desired and observed
//! state in canonical form and converges. Drift is never resolved without the
//! operator: a diff is presented and an explicit decision is required.
//! Nothing outside the named resource is ever read or touched.

pub mod firewall;
pub mod instance;
pub mod ssh_key;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::clients::ResourceApi;
use crate::error::{ProvisionError, Result};
use crate::operator::Operator;
use crate::resource::{DesiredResourceSpec, Observation, ObservedResource, ResourceAttributes, ResourceKind};

pub use firewall::FirewallReconciler;
pub use instance::InstanceReconciler;
pub use ssh_key::SshKeyReconciler;

/// Result of one reconciliation.
#[derive(Debug)]
pub enum ReconciliationOutcome {
    /// Already in the desired state.
    NoOp { id: String },
    Created { id: String },
    /// Drift found and corrected after the operator approved.
    UpdatedWithConsent { id: String },
    /// Drift found and left in place because the operator declined. Still a success.
    KeptDespiteDrift { id: String },
    HardFailure(ProvisionError),
}

impl ReconciliationOutcome {
    pub fn id(&self) -> Option<&str> {
        match self {
            ReconciliationOutcome::NoOp { id }
            | ReconciliationOutcome::Created { id }
            | ReconciliationOutcome::UpdatedWithConsent { id }
            | ReconciliationOutcome::KeptDespiteDrift { id } => Some(id),
            ReconciliationOutcome::HardFailure(_) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, ReconciliationOutcome::HardFailure(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReconciliationOutcome::NoOp { .. } => "unchanged",
            ReconciliationOutcome::Created { .. } => "created",
            ReconciliationOutcome::UpdatedWithConsent { .. } => "updated",
            ReconciliationOutcome::KeptDespiteDrift { .. } => "kept (drift)",
            ReconciliationOutcome::HardFailure(_) => "failed",
        }
    }

    /// The resource id on success, the failure otherwise.
    pub fn into_result(self) -> Result<String> {
        match self {
            ReconciliationOutcome::NoOp { id }
            | ReconciliationOutcome::Created { id }
            | ReconciliationOutcome::UpdatedWithConsent { id }
            | ReconciliationOutcome::KeptDespiteDrift { id } => Ok(id),
            ReconciliationOutcome::HardFailure(e) => Err(e),
        }
    }
}

/// Per-kind reconciliation.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Desired attributes for this kind.
    type Attributes: Sync;

    /// Converge the resource called `name` toward `desired`.
    async fn reconcile(&self, name: &str, desired: &Self::Attributes)
        -> Result<ReconciliationOutcome>;
}

/// Fetch a fresh observation of one named resource.
///
/// An empty provider answer is treated as "absent", the same as an explicit
/// not-found, but is logged since it may hide a transient or auth failure.
pub(crate) async fn observe(
    api: &dyn ResourceApi,
    kind: ResourceKind,
    name: &str,
) -> Result<Option<ObservedResource>> {
    match api.describe(kind, name).await? {
        Observation::Present(resource) => Ok(Some(resource)),
        Observation::Absent => Ok(None),
        Observation::Empty => {
            warn!(
                "Empty describe response for {} '{}'; treating it as absent, \
                 which can hide a transient or authentication failure",
                kind, name
            );
            Ok(None)
        }
    }
}

/// Entry point dispatching a desired spec to the reconciler for its kind.
pub struct ResourceReconciler {
    firewall: FirewallReconciler,
    instance: InstanceReconciler,
    ssh_key: SshKeyReconciler,
}

impl ResourceReconciler {
    pub fn new(api: Arc<dyn ResourceApi>, operator: Arc<dyn Operator>) -> Self {
        Self {
            firewall: FirewallReconciler::new(Arc::clone(&api), Arc::clone(&operator)),
            instance: InstanceReconciler::new(Arc::clone(&api), operator),
            ssh_key: SshKeyReconciler::new(api),
        }
    }

    pub fn instances(&self) -> &InstanceReconciler {
        &self.instance
    }

    pub async fn reconcile(&self, spec: &DesiredResourceSpec) -> ReconciliationOutcome {
        info!("Reconciling {} {}", spec.kind(), spec.name);

        let result = match &spec.attributes {
            ResourceAttributes::Firewall { rules } => self.firewall.reconcile(&spec.name, rules).await,
            ResourceAttributes::Instance(attrs) => self.instance.reconcile(&spec.name, attrs).await,
            ResourceAttributes::SshKey { public_key } => {
                self.ssh_key.reconcile(&spec.name, public_key).await
            }
        };

        match result {
            Ok(outcome) => {
                info!("{} {}: {}", spec.kind(), spec.name, outcome.label());
                outcome
            }
            Err(e) => {
                error!("{} {} reconciliation failed: {}", spec.kind(), spec.name, e);
                ReconciliationOutcome::HardFailure(e)
            }
        }
    }
}
