use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ExecError, Result};

/// One of the three standard streams of a child process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::Stdin => "stdin",
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        };
        f.write_str(name)
    }
}

/// What the child reads on standard input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InputPolicy {
    /// Inherit the parent's standard input
    #[default]
    None,
    /// Feed a literal string, then EOF
    Text { text: String },
    /// Read from a file opened read-only
    File { path: PathBuf },
}

/// Where a child's standard output or standard error goes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OutputPolicy {
    /// Connected to the parent's corresponding stream
    #[default]
    Inherit,
    /// Connected to the platform null device
    Discard,
    /// Written to a file, truncated unless `append` is set
    Export {
        path: PathBuf,
        #[serde(default)]
        append: bool,
    },
    /// Collected into memory and returned with the result
    Capture,
}

impl OutputPolicy {
    pub fn export<P: Into<PathBuf>>(path: P) -> Self {
        OutputPolicy::Export {
            path: path.into(),
            append: false,
        }
    }

    pub fn append<P: Into<PathBuf>>(path: P) -> Self {
        OutputPolicy::Export {
            path: path.into(),
            append: true,
        }
    }

    pub fn is_capture(&self) -> bool {
        matches!(self, OutputPolicy::Capture)
    }
}

impl FromStr for OutputPolicy {
    type Err = ExecError;

    /// Parses `inherit`, `discard`, `capture`, `file:PATH` or `append:PATH`
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inherit" => return Ok(OutputPolicy::Inherit),
            "discard" | "null" => return Ok(OutputPolicy::Discard),
            "capture" => return Ok(OutputPolicy::Capture),
            _ => {}
        }

        let (mode, path) = s.split_once(':').ok_or_else(|| {
            ExecError::InvalidSpecification(format!("Unknown output policy: {}", s))
        })?;
        if path.is_empty() {
            return Err(ExecError::InvalidSpecification(format!(
                "Missing path in output policy: {}",
                s
            )));
        }

        match mode {
            "file" => Ok(OutputPolicy::export(path)),
            "append" => Ok(OutputPolicy::append(path)),
            _ => Err(ExecError::InvalidSpecification(format!(
                "Unknown output policy: {}",
                s
            ))),
        }
    }
}

/// Immutable description of a program invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub executable: PathBuf,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub stdin: InputPolicy,
    #[serde(default)]
    pub stdout: OutputPolicy,
    #[serde(default)]
    pub stderr: OutputPolicy,
}

impl CommandSpec {
    pub fn new<P: Into<PathBuf>>(executable: P) -> Self {
        Self {
            executable: executable.into(),
            arguments: Vec::new(),
            stdin: InputPolicy::None,
            stdout: OutputPolicy::Inherit,
            stderr: OutputPolicy::Inherit,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, policy: InputPolicy) -> Self {
        self.stdin = policy;
        self
    }

    pub fn stdin_text<S: Into<String>>(self, text: S) -> Self {
        self.stdin(InputPolicy::Text { text: text.into() })
    }

    pub fn stdout(mut self, policy: OutputPolicy) -> Self {
        self.stdout = policy;
        self
    }

    pub fn stderr(mut self, policy: OutputPolicy) -> Self {
        self.stderr = policy;
        self
    }

    /// Reject specifications that can never run
    pub fn validate(&self) -> Result<()> {
        if self.executable.as_os_str().is_empty() {
            return Err(ExecError::InvalidSpecification(
                "Executable path is empty".to_string(),
            ));
        }

        if let InputPolicy::File { path } = &self.stdin {
            if path.as_os_str().is_empty() {
                return Err(ExecError::InvalidSpecification(
                    "Input file path is empty".to_string(),
                ));
            }
        }

        for (stream, policy) in [
            (StreamKind::Stdout, &self.stdout),
            (StreamKind::Stderr, &self.stderr),
        ] {
            if let OutputPolicy::Export { path, .. } = policy {
                if path.as_os_str().is_empty() {
                    return Err(ExecError::InvalidSpecification(format!(
                        "Export path for {} is empty",
                        stream
                    )));
                }
            }
        }

        Ok(())
    }

    /// Human-readable rendering of the invocation, for logs and display only.
    /// Execution never goes through a shell.
    pub fn command_line(&self) -> String {
        let mut line = format!("\"{}\"", self.executable.display());
        for argument in &self.arguments {
            line.push(' ');
            line.push_str(&quote_argument(argument));
        }

        match &self.stdin {
            InputPolicy::None => {}
            InputPolicy::Text { text } => {
                line.push_str(&format!(" <<< ({} bytes)", text.len()));
            }
            InputPolicy::File { path } => {
                line.push_str(&format!(" < {}", quote_argument(&path.to_string_lossy())));
            }
        }

        push_redirect(&mut line, "", &self.stdout);
        push_redirect(&mut line, "2", &self.stderr);
        line
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        let spec: CommandSpec = toml::from_str(input)
            .map_err(|e| ExecError::SpecFile(format!("Parse error: {}", e)))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| ExecError::SpecFile(format!("Serialize error: {}", e)))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ExecError::SpecFile(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }
}

fn quote_argument(argument: &str) -> Cow<'_, str> {
    let needs_quotes = argument.is_empty()
        || argument
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | '$' | '`'));
    if needs_quotes {
        Cow::Owned(format!("\"{}\"", argument.replace('\\', "\\\\").replace('"', "\\\"")))
    } else {
        Cow::Borrowed(argument)
    }
}

fn push_redirect(line: &mut String, fd: &str, policy: &OutputPolicy) {
    match policy {
        OutputPolicy::Inherit | OutputPolicy::Capture => {}
        OutputPolicy::Discard => line.push_str(&format!(" {}> (null)", fd)),
        OutputPolicy::Export { path, append } => {
            let op = if *append { ">>" } else { ">" };
            line.push_str(&format!(
                " {}{} {}",
                fd,
                op,
                quote_argument(&path.to_string_lossy())
            ));
        }
    }
}

/// Outcome of a completed command
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub run_id: Uuid,
    /// Present iff the stdout policy was `Capture`
    pub stdout: Option<Vec<u8>>,
    /// Present iff the stderr policy was `Capture`
    pub stderr: Option<Vec<u8>>,
    /// None when the child was terminated by a signal
    pub exit_code: Option<i32>,
    pub terminated_by_signal: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_str(&self) -> Option<Cow<'_, str>> {
        self.stdout.as_deref().map(String::from_utf8_lossy)
    }

    pub fn stderr_str(&self) -> Option<Cow<'_, str>> {
        self.stderr.as_deref().map(String::from_utf8_lossy)
    }
}
