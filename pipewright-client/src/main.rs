use anyhow::Context;
use clap::{Parser, Subcommand};
use pipewright_core::{CommandResult, CommandSpec, InputPolicy, OutputPolicy};
use pipewright_runner::execute;
use serde_json::json;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use tracing::debug;

#[derive(Parser)]
#[command(name = "pw")]
#[command(about = "Run programs with explicit stream redirection", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program
    Run {
        /// Literal text fed to the program's standard input
        #[arg(long, conflicts_with = "stdin_file")]
        stdin_text: Option<String>,

        /// File fed to the program's standard input
        #[arg(long)]
        stdin_file: Option<PathBuf>,

        /// inherit, discard, capture, file:PATH or append:PATH
        #[arg(long, default_value = "inherit")]
        stdout: OutputPolicy,

        /// inherit, discard, capture, file:PATH or append:PATH
        #[arg(long, default_value = "inherit")]
        stderr: OutputPolicy,

        /// Print a JSON report instead of the captured streams
        #[arg(long)]
        json: bool,

        /// Program followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Run a command described by a spec file
    RunFile {
        /// Path to the TOML spec file
        spec: PathBuf,

        /// Print a JSON report instead of the captured streams
        #[arg(long)]
        json: bool,
    },

    /// Generate a spec file template
    Init {
        /// Where to write the template
        #[arg(short, long, default_value = "pipewright.toml")]
        path: PathBuf,
    },
}

const SPEC_TEMPLATE: &str = r#"# Pipewright command spec

executable = "sh"
arguments = ["-c", "echo building; echo warnings >&2"]

# mode: none | text | file
[stdin]
mode = "none"

# mode: inherit | discard | export | capture
[stdout]
mode = "capture"

[stderr]
mode = "export"
path = "build-errors.log"
append = true
"#;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            stdin_text,
            stdin_file,
            stdout,
            stderr,
            json,
            command,
        } => {
            let spec = spec_from_args(command, stdin_text, stdin_file, stdout, stderr)?;
            run_spec(&spec, json)?;
        }
        Commands::RunFile { spec, json } => {
            debug!(path = %spec.display(), "Loading spec file");
            let spec = CommandSpec::load(&spec)?;
            run_spec(&spec, json)?;
        }
        Commands::Init { path } => {
            generate_spec_template(&path)?;
        }
    }

    Ok(())
}

fn spec_from_args(
    command: Vec<String>,
    stdin_text: Option<String>,
    stdin_file: Option<PathBuf>,
    stdout: OutputPolicy,
    stderr: OutputPolicy,
) -> anyhow::Result<CommandSpec> {
    let mut words = command.into_iter();
    let program = words.next().context("No program given")?;

    let stdin = match (stdin_text, stdin_file) {
        (Some(text), _) => InputPolicy::Text { text },
        (None, Some(path)) => InputPolicy::File { path },
        (None, None) => InputPolicy::None,
    };

    let spec = CommandSpec::new(program)
        .args(words)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(stderr);
    spec.validate()?;
    Ok(spec)
}

fn run_spec(spec: &CommandSpec, json: bool) -> anyhow::Result<()> {
    let result =
        execute(spec).with_context(|| format!("Failed to run {}", spec.command_line()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report(&result))?);
    } else {
        if let Some(stdout) = &result.stdout {
            io::stdout().write_all(stdout)?;
        }
        if let Some(stderr) = &result.stderr {
            io::stderr().write_all(stderr)?;
        }
    }
    io::stdout().flush()?;

    process::exit(exit_code_for(&result));
}

fn report(result: &CommandResult) -> serde_json::Value {
    json!({
        "run_id": result.run_id.to_string(),
        "started_at": result.started_at.to_rfc3339(),
        "duration_ms": result.duration_ms,
        "exit_code": result.exit_code,
        "signal": result.terminated_by_signal,
        "stdout": result.stdout_str(),
        "stderr": result.stderr_str(),
    })
}

/// Mirror the child's status the way a shell reports it
fn exit_code_for(result: &CommandResult) -> i32 {
    match (result.exit_code, result.terminated_by_signal) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

fn generate_spec_template(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        eprintln!("Error: spec file already exists at {}", path.display());
        eprintln!("Use a different filename or remove the existing file.");
        process::exit(1);
    }

    fs::write(path, SPEC_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("✓ Created spec template at {}", path.display());
    Ok(())
}
