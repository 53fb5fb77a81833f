//! Subprocess execution for the `setshell`/`shell` meta-commands (spec §4.6).

use std::process::Command as ProcessCommand;

use crate::error::ClientError;

/// Runs `cmd args…`, returning its trimmed stdout parsed as an `i64`
/// (`setshell`'s contract: "expect an integer, store it in `var`").
pub fn run_capturing_integer(cmd: &str, args: &[String]) -> Result<i64, ClientError> {
    let output = ProcessCommand::new(cmd)
        .args(args)
        .output()
        .map_err(|e| ClientError::ShellFailed(e.to_string()))?;
    if !output.status.success() {
        return Err(ClientError::ShellFailed(format!(
            "{cmd} exited with {}",
            output.status
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .trim()
        .parse::<i64>()
        .map_err(|_| ClientError::ShellNonInteger(stdout.trim().to_string()))
}

/// Runs `cmd args…`, discarding stdout. A non-zero exit is a client error
/// unless the process is already terminating (spec §4.6: "failure when the
/// run-time termination flag is false is a client error").
pub fn run_ignoring_output(cmd: &str, args: &[String], terminating: bool) -> Result<(), ClientError> {
    let status = ProcessCommand::new(cmd)
        .args(args)
        .status()
        .map_err(|e| ClientError::ShellFailed(e.to_string()))?;
    if !status.success() && !terminating {
        return Err(ClientError::ShellFailed(format!("{cmd} exited with {status}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_integer_stdout() {
        let v = run_capturing_integer("echo", &["42".to_string()]).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn non_integer_stdout_is_an_error() {
        let err = run_capturing_integer("echo", &["not-a-number".to_string()]).unwrap_err();
        assert!(matches!(err, ClientError::ShellNonInteger(_)));
    }

    #[test]
    fn failing_command_errors_when_not_terminating() {
        let err = run_ignoring_output("false", &[], false).unwrap_err();
        assert!(matches!(err, ClientError::ShellFailed(_)));
    }

    #[test]
    fn failing_command_is_tolerated_while_terminating() {
        assert!(run_ignoring_output("false", &[], true).is_ok());
    }
}
