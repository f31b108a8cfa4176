//! Operator interaction.
//!
//! Reconcilers never decide on drift by themselves; they present what they
//! found and ask. The binary supplies an interactive implementation, the
//! non-interactive ones live here.

use async_trait::async_trait;

use crate::error::Result;

/// Someone (or something) that approves or declines changes.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Show information that precedes a decision (diffs, warnings).
    fn present(&self, message: &str);

    /// Ask a yes/no question. `Err` only when the answer cannot be obtained.
    async fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Fixed answer for every question (`--yes` / `--no`).
pub struct FixedAnswer {
    answer: bool,
}

impl FixedAnswer {
    pub fn approve_all() -> Self {
        Self { answer: true }
    }

    pub fn decline_all() -> Self {
        Self { answer: false }
    }
}

#[async_trait]
impl Operator for FixedAnswer {
    fn present(&self, message: &str) {
        tracing::info!("{}", message);
    }

    async fn confirm(&self, prompt: &str) -> Result<bool> {
        tracing::info!(
            "{} -> {}",
            prompt,
            if self.answer { "yes (assumed)" } else { "no (assumed)" }
        );
        Ok(self.answer)
    }
}
