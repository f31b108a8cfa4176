//! Firewall reconciler.
//!
//! A new firewall is created empty and its rules added one by one. An
//! approved update replaces the whole rule set: every existing rule is
//! deleted, then every desired rule is added. If interrupted in between, the
//! firewall is left with a partial rule set; the next run sees the drift.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use super::{observe, Reconciler, ReconciliationOutcome};
use crate::audit::ProvisionAuditLogger;
use crate::clients::ResourceApi;
use crate::error::{ProvisionError, Result};
use crate::operator::Operator;
use crate::resource::{AttributeDiff, DesiredResourceSpec, FirewallRule, ResourceAttributes, ResourceKind};

/// Firewall reconciler.
pub struct FirewallReconciler {
    api: Arc<dyn ResourceApi>,
    operator: Arc<dyn Operator>,
    audit: ProvisionAuditLogger,
}

impl FirewallReconciler {
    pub fn new(api: Arc<dyn ResourceApi>, operator: Arc<dyn Operator>) -> Self {
        Self {
            api,
            operator,
            audit: ProvisionAuditLogger::new("reconciler"),
        }
    }

    /// Delete `remove`, then add `add`. A failure names the firewall and
    /// what state it was left in, since earlier calls are not undone.
    async fn apply_rules(
        &self,
        name: &str,
        id: &str,
        remove: &[FirewallRule],
        add: &[FirewallRule],
        left: &str,
    ) -> Result<()> {
        let steps = remove
            .iter()
            .map(|rule| (false, rule))
            .chain(add.iter().map(|rule| (true, rule)));

        for (adding, rule) in steps {
            let result = if adding {
                self.api.add_rule(id, rule).await
            } else {
                self.api.delete_rule(id, rule).await
            };
            if let Err(e) = result {
                error!(
                    "Firewall {} ({}) {} while {} '{}'",
                    name,
                    id,
                    left,
                    if adding { "adding" } else { "deleting" },
                    rule.canonical()
                );
                return Err(ProvisionError::external(
                    "hcloud",
                    format!(
                        "firewall '{}' ({}) {}, fix its rules manually: {}",
                        name, id, left, e
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for FirewallReconciler {
    type Attributes = Vec<FirewallRule>;

    async fn reconcile(&self, name: &str, rules: &Self::Attributes) -> Result<ReconciliationOutcome> {
        let desired = ResourceAttributes::Firewall {
            rules: rules.clone(),
        };

        let Some(observed) = observe(self.api.as_ref(), ResourceKind::Firewall, name).await? else {
            let id = self
                .api
                .create(&DesiredResourceSpec::firewall(name, Vec::new()))
                .await?;
            self.audit.resource_created(ResourceKind::Firewall, name, &id);
            info!("Adding {} rules to new firewall {} ({})", rules.len(), name, id);
            self.apply_rules(name, &id, &[], rules, "created with a partial rule set")
                .await?;
            return Ok(ReconciliationOutcome::Created { id });
        };

        if desired.matches(&observed.attributes) {
            return Ok(ReconciliationOutcome::NoOp { id: observed.id });
        }

        let ResourceAttributes::Firewall { rules: existing } = &observed.attributes else {
            return Err(ProvisionError::Internal(format!(
                "provider returned {} attributes for firewall '{}'",
                observed.attributes.kind(),
                name
            )));
        };

        let diff = AttributeDiff::between(&desired, &observed.attributes);
        self.operator.present(&format!(
            "Firewall '{}' ({}) differs from the desired rules:\n{}",
            name, observed.id, diff
        ));
        let approved = self
            .operator
            .confirm(&format!(
                "Replace all {} rules of firewall '{}' with the {} desired rules?",
                existing.len(),
                name,
                rules.len()
            ))
            .await?;

        if !approved {
            self.audit.drift_kept(ResourceKind::Firewall, name, &observed.id);
            return Ok(ReconciliationOutcome::KeptDespiteDrift { id: observed.id });
        }

        info!(
            "Replacing rules of firewall {}: removing {}, adding {}",
            name,
            existing.len(),
            rules.len()
        );
        self.apply_rules(name, &observed.id, existing, rules, "left partially replaced")
            .await?;
        self.audit.resource_updated(ResourceKind::Firewall, name, &observed.id);
        Ok(ReconciliationOutcome::UpdatedWithConsent { id: observed.id })
    }
}
