//! SSH public key reconciler.
//!
//! Trust material under an existing name is never replaced. Matching
//! fingerprints are a no-op; anything else is a hard stop.

use std::sync::Arc;

use async_trait::async_trait;

use super::{observe, Reconciler, ReconciliationOutcome};
use crate::audit::ProvisionAuditLogger;
use crate::clients::ResourceApi;
use crate::error::{ProvisionError, Result};
use crate::keys;
use crate::resource::{DesiredResourceSpec, ResourceAttributes, ResourceKind};

/// SSH key reconciler.
pub struct SshKeyReconciler {
    api: Arc<dyn ResourceApi>,
    audit: ProvisionAuditLogger,
}

impl SshKeyReconciler {
    pub fn new(api: Arc<dyn ResourceApi>) -> Self {
        Self {
            api,
            audit: ProvisionAuditLogger::new("reconciler"),
        }
    }
}

#[async_trait]
impl Reconciler for SshKeyReconciler {
    type Attributes = String;

    async fn reconcile(&self, name: &str, public_key: &Self::Attributes) -> Result<ReconciliationOutcome> {
        let desired = keys::fingerprint(public_key)?;

        let Some(observed) = observe(self.api.as_ref(), ResourceKind::SshKey, name).await? else {
            let id = self
                .api
                .create(&DesiredResourceSpec::ssh_key(name, public_key.trim()))
                .await?;
            self.audit.resource_created(ResourceKind::SshKey, name, &id);
            return Ok(ReconciliationOutcome::Created { id });
        };

        let ResourceAttributes::SshKey { public_key: existing } = &observed.attributes else {
            return Err(ProvisionError::Internal(format!(
                "provider returned {} attributes for ssh key '{}'",
                observed.attributes.kind(),
                name
            )));
        };

        let current = keys::fingerprint(existing)?;
        if current == desired {
            return Ok(ReconciliationOutcome::NoOp { id: observed.id });
        }

        let reason = format!(
            "ssh key '{}' exists with fingerprint {} but the desired key is {}; \
             use a different key name",
            name, current, desired
        );
        self.audit.resource_rejected(ResourceKind::SshKey, name, &reason);
        Err(ProvisionError::Validation(reason))
    }
}
