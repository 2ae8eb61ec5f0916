//! Interactive confirmation on the terminal.

use std::io::{BufRead, Write};

use async_trait::async_trait;
use shellgate_core::{ConfirmationChannel, ConfirmationDecision, ConfirmationRequest};
use tokio::sync::{mpsc, Mutex};

/// Reads answers from stdin on a dedicated thread so an abandoned prompt
/// never leaves a reader behind that steals the next answer.
pub struct StdinConfirmer {
    lines: Mutex<mpsc::Receiver<String>>,
}

impl StdinConfirmer {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(1);
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });
        Self {
            lines: Mutex::new(rx),
        }
    }
}

pub fn parse_answer(line: &str) -> ConfirmationDecision {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ConfirmationDecision::Approve,
        "a" | "all" => ConfirmationDecision::ApproveAllRemaining,
        _ => ConfirmationDecision::Decline,
    }
}

#[async_trait]
impl ConfirmationChannel for StdinConfirmer {
    async fn request_confirmation(&self, request: &ConfirmationRequest) -> ConfirmationDecision {
        {
            let profile = &request.risk_profile;
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "\n{}: {}", request.step_id, request.operation_text);
            let _ = writeln!(err, "  risk: {} -> runs under {}", profile.level, request.mode);
            for reason in &profile.reasons {
                let _ = writeln!(err, "  - {reason}");
            }
            let _ = write!(err, "Proceed? [y]es / [n]o / [a]ll remaining: ");
            let _ = err.flush();
        }

        let mut lines = self.lines.lock().await;
        match lines.recv().await {
            Some(line) => parse_answer(&line),
            None => ConfirmationDecision::Decline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("Y"), ConfirmationDecision::Approve);
        assert_eq!(parse_answer(" all "), ConfirmationDecision::ApproveAllRemaining);
        assert_eq!(parse_answer(""), ConfirmationDecision::Decline);
        assert_eq!(parse_answer("nope"), ConfirmationDecision::Decline);
    }
}
