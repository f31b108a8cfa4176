//! Audit logging
//!
//! Domain-specific audit events, emitted as `tracing` events on the `audit`
//! target so they can be routed separately from diagnostic output. Never pass
//! secret values to any of these methods.

use crate::credential::BackendKind;
use crate::resource::ResourceKind;

/// Audit logger with domain-specific methods.
#[derive(Debug, Clone, Copy)]
pub struct ProvisionAuditLogger {
    component: &'static str,
}

impl ProvisionAuditLogger {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }

    fn log(&self, message: String, object_ids: &[&str]) {
        tracing::info!(
            target: "audit",
            component = self.component,
            objects = %object_ids.join(","),
            "{}",
            message
        );
    }

    fn warn(&self, message: String, object_ids: &[&str]) {
        tracing::warn!(
            target: "audit",
            component = self.component,
            objects = %object_ids.join(","),
            "{}",
            message
        );
    }

    // === Resource Events ===

    pub fn resource_created(&self, kind: ResourceKind, name: &str, id: &str) {
        self.log(format!("{} '{}' created", kind, name), &[id]);
    }

    pub fn resource_updated(&self, kind: ResourceKind, name: &str, id: &str) {
        self.log(format!("{} '{}' updated with operator consent", kind, name), &[id]);
    }

    pub fn drift_kept(&self, kind: ResourceKind, name: &str, id: &str) {
        self.warn(format!("{} '{}' kept despite drift", kind, name), &[id]);
    }

    pub fn resource_rejected(&self, kind: ResourceKind, name: &str, reason: &str) {
        self.warn(format!("{} '{}' rejected: {}", kind, name, reason), &[name]);
    }

    // === Run Events ===

    pub fn run_started(&self, run_id: &str, steps: usize) {
        self.log(format!("Provisioning run started ({} steps)", steps), &[run_id]);
    }

    pub fn remote_object_recorded(&self, run_id: &str, description: &str) {
        self.log(format!("Recorded compensation: {}", description), &[run_id]);
    }

    pub fn compensated(&self, run_id: &str, description: &str) {
        self.log(format!("Compensated: {}", description), &[run_id]);
    }

    pub fn compensation_failed(&self, run_id: &str, description: &str, error: &str) {
        self.warn(
            format!("Compensation failed, left behind: {} ({})", description, error),
            &[run_id],
        );
    }

    pub fn run_finished(&self, run_id: &str, state: &str) {
        self.log(format!("Provisioning run finished: {}", state), &[run_id]);
    }

    // === Credential Events ===

    pub fn credential_initialized(&self, project: &str, backend: BackendKind) {
        self.log(
            format!("Credential for '{}' initialised in {} backend", project, backend),
            &[project],
        );
    }

    pub fn credential_migrated(&self, project: &str, vault: &str) {
        self.log(
            format!("Credential for '{}' migrated from files into vault '{}'", project, vault),
            &[project],
        );
    }

    pub fn credential_replaced(&self, project: &str, vault: &str, orphaned: &str) {
        self.warn(
            format!(
                "Credential for '{}' regenerated in vault '{}'; original key left at {}",
                project, vault, orphaned
            ),
            &[project],
        );
    }

    pub fn secret_persisted(&self, project: &str, backend: BackendKind, keys: &[&str]) {
        self.log(
            format!(
                "Secrets persisted for '{}' in {} backend: {}",
                project,
                backend,
                keys.join(", ")
            ),
            &[project],
        );
    }
}
