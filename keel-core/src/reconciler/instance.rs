//! Compute instance reconciler.
//!
//! Instances are matched by name only. An existing instance is reused only
//! when the operator says so; declining is terminal and the operator must pick
//! another name. Instances are never deleted or recreated here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{observe, Reconciler, ReconciliationOutcome};
use crate::audit::ProvisionAuditLogger;
use crate::clients::ResourceApi;
use crate::error::{ProvisionError, Result};
use crate::operator::Operator;
use crate::poll::{self, PollOutcome};
use crate::resource::{
    AttributeDiff, DesiredResourceSpec, InstanceAttributes, ObservedResource, ResourceAttributes,
    ResourceKind,
};

/// Instance reconciler.
pub struct InstanceReconciler {
    api: Arc<dyn ResourceApi>,
    operator: Arc<dyn Operator>,
    audit: ProvisionAuditLogger,
}

impl InstanceReconciler {
    pub fn new(api: Arc<dyn ResourceApi>, operator: Arc<dyn Operator>) -> Self {
        Self {
            api,
            operator,
            audit: ProvisionAuditLogger::new("reconciler"),
        }
    }

    /// Fresh observation of the instance, if it exists.
    pub async fn observe(&self, name: &str) -> Result<Option<ObservedResource>> {
        observe(self.api.as_ref(), ResourceKind::Instance, name).await
    }

    /// Wait until the instance is running and has a public address.
    pub async fn wait_ready(&self, name: &str, interval: Duration, timeout: Duration) -> PollOutcome {
        info!("Waiting up to {}s for instance {} to become ready", timeout.as_secs(), name);
        poll::wait_until(interval, timeout, || async move {
            Ok(self
                .observe(name)
                .await?
                .map(|i| i.status.as_deref() == Some("running") && i.public_ipv4.is_some())
                .unwrap_or(false))
        })
        .await
    }
}

#[async_trait]
impl Reconciler for InstanceReconciler {
    type Attributes = InstanceAttributes;

    async fn reconcile(&self, name: &str, attrs: &Self::Attributes) -> Result<ReconciliationOutcome> {
        let Some(observed) = self.observe(name).await? else {
            let id = self
                .api
                .create(&DesiredResourceSpec::instance(name, attrs.clone()))
                .await?;
            self.audit.resource_created(ResourceKind::Instance, name, &id);
            return Ok(ReconciliationOutcome::Created { id });
        };

        let desired = ResourceAttributes::Instance(attrs.clone());
        let diff = AttributeDiff::between(&desired, &observed.attributes);

        let mut message = format!(
            "Instance '{}' already exists (id {}, status {}).",
            name,
            observed.id,
            observed.status.as_deref().unwrap_or("unknown")
        );
        if !diff.is_empty() {
            message.push_str(&format!(" It differs from the desired spec:\n{}", diff));
        }
        self.operator.present(&message);

        if !self
            .operator
            .confirm(&format!("Reuse existing instance '{}'?", name))
            .await?
        {
            return Err(ProvisionError::UserAbort(format!(
                "instance '{}' exists and reuse was declined; choose a different name",
                name
            )));
        }

        if diff.is_empty() {
            Ok(ReconciliationOutcome::NoOp { id: observed.id })
        } else {
            self.audit.drift_kept(ResourceKind::Instance, name, &observed.id);
            Ok(ReconciliationOutcome::KeptDespiteDrift { id: observed.id })
        }
    }
}
