//! Run-scoped rollback stack.
//!
//! Entries can only be pushed, unwound (LIFO, each compensation invoked once)
//! or cleared (dropped without invoking). There is no way to inspect entries.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{info, warn};

use crate::error::Result;

type CompensatingAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A compensating action for one remote side effect.
pub struct RollbackEntry {
    description: String,
    action: CompensatingAction,
}

impl RollbackEntry {
    /// `action` must tolerate the side effect having already been undone.
    pub fn new<F, Fut>(description: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            description: description.into(),
            action: Box::new(move || action().boxed()),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for RollbackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackEntry")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// A compensation that failed; the side effect it should have undone remains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeftBehind {
    pub description: String,
    pub error: String,
}

impl fmt::Display for LeftBehind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description, self.error)
    }
}

/// Result of unwinding a stack, in the order compensations ran.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnwindReport {
    pub compensated: Vec<String>,
    pub left_behind: Vec<LeftBehind>,
}

impl UnwindReport {
    pub fn is_complete(&self) -> bool {
        self.left_behind.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RollbackStack {
    entries: Vec<RollbackEntry>,
}

impl RollbackStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: RollbackEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pop and run every compensation, newest first. A failing (or panicking)
    /// compensation is recorded and skipped; nothing is retried. The stack is
    /// empty afterwards.
    pub async fn unwind(&mut self) -> UnwindReport {
        let mut report = UnwindReport::default();

        while let Some(entry) = self.entries.pop() {
            info!("Compensating: {}", entry.description);
            let result = match AssertUnwindSafe((entry.action)()).catch_unwind().await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err("compensation panicked".to_string()),
            };

            match result {
                Ok(()) => report.compensated.push(entry.description),
                Err(error) => {
                    warn!("Compensation failed for {}: {}", entry.description, error);
                    report.left_behind.push(LeftBehind {
                        description: entry.description,
                        error,
                    });
                }
            }
        }

        report
    }

    /// Drop every entry without invoking it. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}
