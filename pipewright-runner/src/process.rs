// Process creation, waiting and teardown around the three stream channels

use crate::channel::{InputChannel, OutputChannel, StreamChannel};
use pipewright_core::{CommandSpec, ExecError, Result, StreamKind};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Started,
    Stopped,
    Failed,
}

/// Drives one child process from creation to exit.
///
/// The runner borrows the executable and arguments from the specification it
/// was built from and owns the channels and the child handle. It is single
/// use: `Idle -> Started -> Stopped`, or `Failed` if `start` errors.
#[derive(Debug)]
pub struct ProcessRunner<'a> {
    executable: &'a Path,
    arguments: &'a [String],
    command_line: String,
    stdin: InputChannel,
    stdout: OutputChannel,
    stderr: OutputChannel,
    state: RunnerState,
    child: Option<Child>,
    exit_status: Option<ExitStatus>,
    termination_requested: bool,
}

impl<'a> ProcessRunner<'a> {
    pub fn new(spec: &'a CommandSpec) -> Self {
        Self {
            executable: &spec.executable,
            arguments: &spec.arguments,
            command_line: spec.command_line(),
            stdin: InputChannel::from_policy(&spec.stdin),
            stdout: OutputChannel::from_policy(&spec.stdout, StreamKind::Stdout),
            stderr: OutputChannel::from_policy(&spec.stderr, StreamKind::Stderr),
            state: RunnerState::Idle,
            child: None,
            exit_status: None,
            termination_requested: false,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Native process id, while the child is running
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Acquire stream resources, spawn the child and start stream transfer.
    ///
    /// # Panics
    ///
    /// If the runner has already been started.
    pub fn start(&mut self) -> Result<()> {
        assert_eq!(
            self.state,
            RunnerState::Idle,
            "process runner can only be started once"
        );
        debug!(command = %self.command_line, "Starting process");

        match self.spawn() {
            Ok(child) => {
                self.child = Some(child);
                self.state = RunnerState::Started;
            }
            Err(e) => {
                self.state = RunnerState::Failed;
                error!(command = %self.command_line, error = %e, "Process start failed");
                return Err(e);
            }
        }

        if let Err(e) = self.each_channel(|channel| channel.after_start()) {
            error!(command = %self.command_line, error = %e, "Stream setup after spawn failed");
            self.abandon_child();
            self.state = RunnerState::Failed;
            return Err(e);
        }

        Ok(())
    }

    fn spawn(&mut self) -> Result<Child> {
        self.each_channel(|channel| channel.before_start())?;

        let program = resolve_executable(self.executable)?;

        let mut command = Command::new(&program);
        command.args(self.arguments);
        command.stdin(
            self.stdin
                .child_stdio()
                .map_err(|source| resource_error(StreamKind::Stdin, source))?,
        );
        command.stdout(
            self.stdout
                .child_stdio()
                .map_err(|source| resource_error(StreamKind::Stdout, source))?,
        );
        command.stderr(
            self.stderr
                .child_stdio()
                .map_err(|source| resource_error(StreamKind::Stderr, source))?,
        );

        let child = command.spawn().map_err(|source| ExecError::ProcessCreation {
            executable: program.display().to_string(),
            source,
        })?;

        // The command still holds the child's pipe ends; closing them here is
        // what lets the drain threads see EOF once the child exits.
        drop(command);

        debug!(pid = child.id(), program = %program.display(), "Process spawned");
        Ok(child)
    }

    /// Ask a started child to terminate. A following `stop` waits for the
    /// forced exit.
    pub fn terminate(&mut self) -> Result<()> {
        if self.state != RunnerState::Started || self.termination_requested {
            return Ok(());
        }
        if let Some(child) = self.child.as_mut() {
            debug!(pid = child.id(), "Terminating process");
            match child.kill() {
                Ok(()) => {}
                // Already exited and not yet reaped.
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
                Err(e) => return Err(ExecError::IoError(e)),
            }
        }
        self.termination_requested = true;
        Ok(())
    }

    /// Finish stream transfer, wait for the child and release resources.
    /// A no-op once stopped, or after a failed start.
    ///
    /// # Panics
    ///
    /// If called before `start`.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            RunnerState::Idle => panic!("process runner stopped before it was started"),
            RunnerState::Stopped | RunnerState::Failed => return Ok(()),
            RunnerState::Started => {}
        }

        // Teardown always runs to completion; the first failure is reported.
        let mut first_error = self.each_channel_drained(|channel| channel.before_stop());

        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) => self.exit_status = Some(status),
                Err(e) => {
                    first_error.get_or_insert(ExecError::Wait(e));
                }
            }
        }

        if let Some(e) = self.each_channel_drained(|channel| channel.after_stop()) {
            first_error.get_or_insert(e);
        }

        self.state = RunnerState::Stopped;
        debug!(
            command = %self.command_line,
            exit_code = ?self.status_code(),
            terminated = self.termination_requested,
            "Process stopped"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Captured standard output, present iff its policy was capture
    ///
    /// # Panics
    ///
    /// If the runner has not been stopped.
    pub fn output(&self) -> Option<&[u8]> {
        self.assert_finished();
        self.stdout.captured()
    }

    /// Captured standard error, present iff its policy was capture
    ///
    /// # Panics
    ///
    /// If the runner has not been stopped.
    pub fn error_output(&self) -> Option<&[u8]> {
        self.assert_finished();
        self.stderr.captured()
    }

    pub fn take_output(&mut self) -> Option<Vec<u8>> {
        self.assert_finished();
        self.stdout.take_captured()
    }

    pub fn take_error_output(&mut self) -> Option<Vec<u8>> {
        self.assert_finished();
        self.stderr.take_captured()
    }

    /// Exit code of the child. None if it was killed by a signal or never ran.
    pub fn status_code(&self) -> Option<i32> {
        self.exit_status.and_then(|status| status.code())
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Signal that terminated the child, if any
    #[cfg(unix)]
    pub fn signal(&self) -> Option<i32> {
        use std::os::unix::process::ExitStatusExt;
        self.exit_status.and_then(|status| status.signal())
    }

    #[cfg(not(unix))]
    pub fn signal(&self) -> Option<i32> {
        None
    }

    fn assert_finished(&self) {
        assert!(
            matches!(self.state, RunnerState::Stopped | RunnerState::Failed),
            "process output read before the runner was stopped"
        );
    }

    /// Run a hook on stdin, stdout and stderr in order, stopping at the first
    /// failure.
    fn each_channel<F>(&mut self, mut hook: F) -> Result<()>
    where
        F: FnMut(&mut dyn StreamChannel) -> io::Result<()>,
    {
        for (stream, channel) in self.channels() {
            hook(channel).map_err(|source| resource_error(stream, source))?;
        }
        Ok(())
    }

    /// Run a hook on every channel regardless of failures, returning the
    /// first one.
    fn each_channel_drained<F>(&mut self, mut hook: F) -> Option<ExecError>
    where
        F: FnMut(&mut dyn StreamChannel) -> io::Result<()>,
    {
        let mut first_error = None;
        for (stream, channel) in self.channels() {
            if let Err(source) = hook(channel) {
                warn!(stream = %stream, error = %source, "Stream teardown failed");
                first_error.get_or_insert(ExecError::Drain { stream, source });
            }
        }
        first_error
    }

    fn channels(&mut self) -> [(StreamKind, &mut dyn StreamChannel); 3] {
        [
            (StreamKind::Stdin, &mut self.stdin as &mut dyn StreamChannel),
            (StreamKind::Stdout, &mut self.stdout as &mut dyn StreamChannel),
            (StreamKind::Stderr, &mut self.stderr as &mut dyn StreamChannel),
        ]
    }

    fn abandon_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for ProcessRunner<'_> {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_ref() {
            warn!(pid = child.id(), command = %self.command_line, "Runner dropped with a live process, killing it");
            self.abandon_child();
        }
    }
}

fn resource_error(stream: StreamKind, source: io::Error) -> ExecError {
    ExecError::ResourceAcquisition { stream, source }
}

/// Locate the executable the way a shell would, without running one
fn resolve_executable(executable: &Path) -> Result<PathBuf> {
    which::which(executable).map_err(|e| {
        ExecError::ExecutableNotFound(format!("{} ({})", executable.display(), e))
    })
}
