use std::io::Write;
use std::process::ExitCode;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use warehouse_store_sqlite::{classify_failure, Failure};

/// Body written to stderr when a command fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: Failure,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            error: classify_failure(err),
        }
    }
}

/// Process exit status for a failure code.
#[must_use]
pub fn exit_code(code: &str) -> u8 {
    match code {
        "validation_error" | "precondition_failed" => 2,
        "not_found" => 3,
        "conflict" => 4,
        "forbidden" => 5,
        "configuration_error" => 6,
        _ => 1,
    }
}

pub(crate) fn print_json(value: &Value) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value).context("failed to write command output")?;
    writeln!(stdout).context("failed to write command output")?;
    Ok(())
}

/// Prints the error envelope to stderr and maps it to an exit status.
#[must_use]
pub fn report_failure(err: &anyhow::Error) -> ExitCode {
    let envelope = ErrorEnvelope::from_error(err);
    tracing::debug!(error = %format!("{err:#}"), code = %envelope.error.code, "command failed");
    let body = serde_json::to_string(&envelope).unwrap_or_else(|_| {
        format!(
            "{{\"error\":{{\"code\":\"internal\",\"message\":{:?}}}}}",
            envelope.error.message
        )
    });
    eprintln!("{body}");
    ExitCode::from(exit_code(&envelope.error.code))
}
