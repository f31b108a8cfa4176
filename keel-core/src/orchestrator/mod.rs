//! Transactional multi-step provisioning.
//!
//! An [`Orchestrator`] runs an ordered list of [`ProvisionStep`]s. Every step
//! that creates a deletable remote object hands back a [`RollbackEntry`],
//! which is pushed onto the run's [`RollbackStack`] before the next step
//! starts. The first failure (a returned error or a panic) unwinds the stack
//! newest-first; a clean run clears it and moves on to verification.

pub mod identity;
pub mod rollback;

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::ProvisionAuditLogger;
use crate::error::{ProvisionError, Result};

pub use identity::{identity_plan, AppPairState, RegistrationVerifier, Role};
pub use rollback::{LeftBehind, RollbackEntry, RollbackStack, UnwindReport};

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    /// Executing the step at this index.
    Running(usize),
    Succeeded,
    RollingBack,
    RolledBack,
    /// At least one compensation failed.
    RollbackIncomplete,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Pending => f.write_str("pending"),
            RunState::Running(index) => write!(f, "running step {}", index + 1),
            RunState::Succeeded => f.write_str("succeeded"),
            RunState::RollingBack => f.write_str("rolling back"),
            RunState::RolledBack => f.write_str("rolled back"),
            RunState::RollbackIncomplete => f.write_str("rollback incomplete"),
        }
    }
}

/// Everything one run owns. Created by the caller, handed to
/// [`Orchestrator::run`] by mutable reference.
#[derive(Debug)]
pub struct RunContext<S> {
    pub run_id: Uuid,
    /// Only the orchestrator pushes or unwinds; steps hand entries back
    /// through [`StepOutcome::Created`].
    pub(crate) rollback: RollbackStack,
    pub status: RunState,
    /// Values produced by earlier steps and consumed by later ones.
    pub state: S,
}

impl<S> RunContext<S> {
    pub fn new(state: S) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            rollback: RollbackStack::new(),
            status: RunState::Pending,
            state,
        }
    }

    /// Whether no compensations are pending.
    pub fn rollback_is_empty(&self) -> bool {
        self.rollback.is_empty()
    }
}

/// What a successful step left behind.
#[derive(Debug)]
pub enum StepOutcome {
    Done,
    /// A remote object was created; the entry undoes it.
    Created(RollbackEntry),
    /// Completed with a non-fatal problem.
    Warning(String),
}

#[async_trait]
pub trait ProvisionStep<S: Send>: Send + Sync {
    fn name(&self) -> String;

    async fn execute(&self, ctx: &mut RunContext<S>) -> Result<StepOutcome>;
}

/// Post-run checks against the provider. Findings never undo the run.
#[async_trait]
pub trait Verifier<S: Sync>: Send + Sync {
    async fn verify(&self, state: &S) -> Vec<String>;
}

/// A completed run. Warnings mean partial success: provisioning finished but
/// something needs the operator's attention.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub steps_completed: usize,
    pub warnings: Vec<String>,
}

impl RunSummary {
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// A failed run, after rollback.
#[derive(Debug, Error)]
pub struct RunFailure {
    pub run_id: Uuid,
    /// `None` when the run was refused before any step started.
    pub step: Option<String>,
    #[source]
    pub error: ProvisionError,
    pub state: RunState,
    pub compensated: Vec<String>,
    pub left_behind: Vec<LeftBehind>,
}

impl RunFailure {
    pub fn is_user_abort(&self) -> bool {
        self.error.is_user_abort()
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(step) => write!(f, "step '{}' failed: {}", step, self.error)?,
            None => write!(f, "run refused: {}", self.error)?,
        }
        write!(f, " [{}, {} compensated]", self.state, self.compensated.len())?;
        if self.left_behind.is_empty() {
            write!(f, "; nothing left behind")
        } else {
            write!(f, "; left behind, clean up manually:")?;
            for entry in &self.left_behind {
                write!(f, "\n  - {}", entry)?;
            }
            Ok(())
        }
    }
}

pub struct Orchestrator<S: Send + Sync> {
    steps: Vec<Box<dyn ProvisionStep<S>>>,
    verifier: Option<Box<dyn Verifier<S>>>,
    audit: ProvisionAuditLogger,
}

impl<S: Send + Sync> Orchestrator<S> {
    pub fn new(steps: Vec<Box<dyn ProvisionStep<S>>>) -> Self {
        Self {
            steps,
            verifier: None,
            audit: ProvisionAuditLogger::new("orchestrator"),
        }
    }

    pub fn with_verifier(mut self, verifier: Box<dyn Verifier<S>>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order.
    pub async fn run(&self, ctx: &mut RunContext<S>) -> std::result::Result<RunSummary, RunFailure> {
        let run_id = ctx.run_id.to_string();

        if !ctx.rollback.is_empty() {
            return Err(RunFailure {
                run_id: ctx.run_id,
                step: None,
                error: ProvisionError::Validation(format!(
                    "rollback stack holds {} entries from another run",
                    ctx.rollback.len()
                )),
                state: ctx.status,
                compensated: Vec::new(),
                left_behind: Vec::new(),
            });
        }

        self.audit.run_started(&run_id, self.steps.len());
        let mut warnings = Vec::new();

        for (index, step) in self.steps.iter().enumerate() {
            transition(ctx, RunState::Running(index));
            let name = step.name();
            info!(run_id = %run_id, step = %name, "Executing step");

            let result = match AssertUnwindSafe(step.execute(ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(ProvisionError::Internal(format!(
                    "step panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            };

            match result {
                Ok(StepOutcome::Done) => {}
                Ok(StepOutcome::Created(entry)) => {
                    self.audit.remote_object_recorded(&run_id, entry.description());
                    ctx.rollback.push(entry);
                }
                Ok(StepOutcome::Warning(warning)) => {
                    warn!(run_id = %run_id, step = %name, "{}", warning);
                    warnings.push(warning);
                }
                Err(error) => return Err(self.roll_back(ctx, name, error).await),
            }
        }

        let dropped = ctx.rollback.clear();
        debug!(run_id = %run_id, entries = dropped, "Cleared rollback stack");
        transition(ctx, RunState::Succeeded);

        if let Some(verifier) = &self.verifier {
            let findings = verifier.verify(&ctx.state).await;
            for finding in &findings {
                warn!(run_id = %run_id, "Verification: {}", finding);
            }
            warnings.extend(findings);
        }

        self.audit.run_finished(&run_id, &ctx.status.to_string());
        Ok(RunSummary {
            run_id: ctx.run_id,
            steps_completed: self.steps.len(),
            warnings,
        })
    }

    async fn roll_back(&self, ctx: &mut RunContext<S>, step: String, error: ProvisionError) -> RunFailure {
        let run_id = ctx.run_id.to_string();
        error!(run_id = %run_id, step = %step, error = %error, "Step failed");

        transition(ctx, RunState::RollingBack);
        let report = ctx.rollback.unwind().await;

        for description in &report.compensated {
            self.audit.compensated(&run_id, description);
        }
        for entry in &report.left_behind {
            self.audit
                .compensation_failed(&run_id, &entry.description, &entry.error);
        }

        let terminal = if report.is_complete() {
            RunState::RolledBack
        } else {
            RunState::RollbackIncomplete
        };
        transition(ctx, terminal);
        self.audit.run_finished(&run_id, &terminal.to_string());

        RunFailure {
            run_id: ctx.run_id,
            step: Some(step),
            error,
            state: terminal,
            compensated: report.compensated,
            left_behind: report.left_behind,
        }
    }
}

fn transition<S>(ctx: &mut RunContext<S>, to: RunState) {
    debug!(run_id = %ctx.run_id, from = %ctx.status, to = %to, "Run state transitioned");
    ctx.status = to;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
