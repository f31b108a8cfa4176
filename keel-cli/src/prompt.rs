//! Interactive operator on the controlling terminal.

use async_trait::async_trait;
use keel_core::operator::Operator;
use keel_core::{ProvisionError, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tokio::sync::Mutex;
use tracing::warn;

/// Asks on stdout, reads answers from stdin. Anything but `y`/`yes` declines.
pub struct TerminalOperator {
    input: Mutex<BufReader<Stdin>>,
}

impl TerminalOperator {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }
}

impl Default for TerminalOperator {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_answer(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[async_trait]
impl Operator for TerminalOperator {
    fn present(&self, message: &str) {
        println!("{}", message);
    }

    async fn confirm(&self, prompt: &str) -> Result<bool> {
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("{} [y/N] ", prompt).as_bytes())
            .await?;
        stdout.flush().await?;

        let mut line = String::new();
        let read = self.input.lock().await.read_line(&mut line).await?;
        if read == 0 {
            warn!("stdin closed, treating '{}' as declined", prompt);
            return Ok(false);
        }
        Ok(parse_answer(&line))
    }
}

/// Operator answer for a timed-out wait, shared by the `up` flow.
pub async fn confirm_or_abort(operator: &dyn Operator, prompt: &str, reason: &str) -> Result<()> {
    if operator.confirm(prompt).await? {
        Ok(())
    } else {
        Err(ProvisionError::UserAbort(reason.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert!(parse_answer("y\n"));
        assert!(parse_answer(" YES "));
        assert!(!parse_answer("\n"));
        assert!(!parse_answer("no"));
        assert!(!parse_answer("yep"));
    }

    #[tokio::test]
    async fn test_default_reads_stdin() {
        let operator = TerminalOperator::default();
        operator.present("nothing to confirm");
    }
}
