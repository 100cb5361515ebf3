use crate::process::ProcessRunner;
use chrono::Utc;
use pipewright_core::{CommandResult, CommandSpec, Result};
use tracing::{error, info};
use uuid::Uuid;

/// Run a command to completion and collect what its policies ask for.
///
/// Errors carry the phase that failed (see [`pipewright_core::ExecError::phase`]).
/// When the process never started, no stop-phase work is done.
pub fn execute(spec: &CommandSpec) -> Result<CommandResult> {
    spec.validate()?;

    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let start_instant = std::time::Instant::now();

    info!(
        run_id = %run_id,
        command = %spec.command_line(),
        "Executing command"
    );

    let mut runner = ProcessRunner::new(spec);
    if let Err(e) = runner.start() {
        error!(run_id = %run_id, phase = ?e.phase(), error = %e, "Command failed to start");
        return Err(e);
    }

    if let Err(e) = runner.stop() {
        error!(run_id = %run_id, phase = ?e.phase(), error = %e, "Command teardown failed");
        return Err(e);
    }

    let duration_ms = start_instant.elapsed().as_millis() as u64;
    let result = CommandResult {
        run_id,
        stdout: runner.take_output(),
        stderr: runner.take_error_output(),
        exit_code: runner.status_code(),
        terminated_by_signal: runner.signal(),
        started_at,
        duration_ms,
    };

    info!(
        run_id = %run_id,
        exit_code = ?result.exit_code,
        duration_ms,
        "Command completed"
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::{ExecError, FailurePhase, InputPolicy, OutputPolicy};

    const MIB: usize = 1024 * 1024;

    #[cfg(unix)]
    #[test]
    fn test_execute_echo_hello() {
        let spec = CommandSpec::new("echo")
            .arg("hello")
            .stdout(OutputPolicy::Capture);

        let result = execute(&spec).unwrap();

        assert_eq!(result.stdout.as_deref(), Some(&b"hello\n"[..]));
        assert!(result.stderr.is_none());
        assert_eq!(result.exit_code, Some(0));
        assert!(result.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_cat_literal_input() {
        let spec = CommandSpec::new("cat")
            .stdin_text("abc")
            .stdout(OutputPolicy::Capture);

        let result = execute(&spec).unwrap();

        assert_eq!(result.stdout_str().as_deref(), Some("abc"));
        assert_eq!(result.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_literal_input_is_not_shell_interpreted() {
        let text = "\"$HOME\" `id` ; exit 7\n";
        let spec = CommandSpec::new("cat")
            .stdin_text(text)
            .stdout(OutputPolicy::Capture);

        let result = execute(&spec).unwrap();

        assert_eq!(result.stdout_str().as_deref(), Some(text));
        assert_eq!(result.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_arguments_are_not_shell_interpreted() {
        let spec = CommandSpec::new("echo")
            .args(["$HOME", "a b", "*"])
            .stdout(OutputPolicy::Capture);

        let result = execute(&spec).unwrap();

        assert_eq!(result.stdout_str().as_deref(), Some("$HOME a b *\n"));
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_captures_more_than_pipe_buffer() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "head -c 1048576 /dev/zero | tr '\\000' 'a'"])
            .stdout(OutputPolicy::Capture);

        let result = execute(&spec).unwrap();

        let stdout = result.stdout.unwrap();
        assert_eq!(stdout.len(), MIB);
        assert!(stdout.iter().all(|&b| b == b'a'));
        assert_eq!(result.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_captures_both_streams_concurrently() {
        // stderr is filled first; a sequential drain of stdout would deadlock
        let spec = CommandSpec::new("sh")
            .args([
                "-c",
                "head -c 1048576 /dev/zero >&2; head -c 1048576 /dev/zero",
            ])
            .stdout(OutputPolicy::Capture)
            .stderr(OutputPolicy::Capture);

        let result = execute(&spec).unwrap();

        assert_eq!(result.stdout.unwrap().len(), MIB);
        assert_eq!(result.stderr.unwrap().len(), MIB);
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_large_literal_input_round_trip() {
        let text: String = (0..MIB).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        let spec = CommandSpec::new("cat")
            .stdin_text(text.clone())
            .stdout(OutputPolicy::Capture);

        let result = execute(&spec).unwrap();

        assert_eq!(result.stdout.unwrap(), text.into_bytes());
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_child_ignoring_input() {
        let spec = CommandSpec::new("true").stdin_text("x".repeat(MIB));

        let result = execute(&spec).unwrap();

        assert_eq!(result.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_discard_output() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "head -c 1048576 /dev/zero; echo visible >&2"])
            .stdout(OutputPolicy::Discard)
            .stderr(OutputPolicy::Capture);

        let result = execute(&spec).unwrap();

        assert!(result.stdout.is_none());
        assert_eq!(result.stderr_str().as_deref(), Some("visible\n"));
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_export_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "previous contents that are longer\n").unwrap();

        let spec = CommandSpec::new("echo")
            .arg("fresh")
            .stdout(OutputPolicy::export(&path));
        let result = execute(&spec).unwrap();

        assert!(result.stdout.is_none());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_export_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "first\n").unwrap();

        let spec = CommandSpec::new("echo")
            .arg("second")
            .stdout(OutputPolicy::append(&path));
        execute(&spec).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_stderr_export_uses_its_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let err = dir.path().join("err.txt");

        let spec = CommandSpec::new("sh")
            .args(["-c", "echo to-out; echo to-err >&2"])
            .stdout(OutputPolicy::export(&out))
            .stderr(OutputPolicy::export(&err));
        execute(&spec).unwrap();

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "to-out\n");
        assert_eq!(std::fs::read_to_string(&err).unwrap(), "to-err\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_input_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        std::fs::write(&path, "line one\nline two\n").unwrap();

        let spec = CommandSpec::new("cat")
            .stdin(InputPolicy::File { path })
            .stdout(OutputPolicy::Capture);
        let result = execute(&spec).unwrap();

        assert_eq!(result.stdout_str().as_deref(), Some("line one\nline two\n"));
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_exit_codes() {
        for code in [0, 1, 127, 255] {
            let spec = CommandSpec::new("sh").args(["-c".to_string(), format!("exit {}", code)]);
            let result = execute(&spec).unwrap();
            assert_eq!(result.exit_code, Some(code));
            assert!(result.terminated_by_signal.is_none());
        }
    }

    #[test]
    fn test_execute_missing_executable() {
        let spec = CommandSpec::new("/nonexistent/pipewright-missing-binary")
            .stdout(OutputPolicy::Capture)
            .stderr(OutputPolicy::Capture);

        let err = execute(&spec).unwrap_err();

        assert!(matches!(err, ExecError::ExecutableNotFound(_)));
        assert_eq!(err.phase(), FailurePhase::ProcessCreation);
    }

    #[test]
    fn test_execute_rejects_invalid_spec() {
        let err = execute(&CommandSpec::new("")).unwrap_err();
        assert_eq!(err.phase(), FailurePhase::Setup);
    }

    #[test]
    fn test_execute_resource_failure_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let spec = CommandSpec::new("touch")
            .arg(marker.to_string_lossy().to_string())
            .stdout(OutputPolicy::export(dir.path().join("missing/out.txt")));

        let err = execute(&spec).unwrap_err();

        assert_eq!(err.phase(), FailurePhase::Setup);
        assert!(!marker.exists());
    }
}
