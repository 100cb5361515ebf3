//! Per-stream I/O channels.
//!
//! Each channel implements one redirection policy for one standard stream and
//! owns whatever OS resource that policy needs. The process runner only talks
//! to a channel through [`StreamChannel`].

use pipewright_core::{InputPolicy, OutputPolicy, StreamKind};
use std::fs::{File, OpenOptions};
use std::io::{self, PipeReader, PipeWriter, Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// Lifecycle hooks invoked by the process runner, in this order:
/// `before_start`, `child_stdio`, `after_start`, `before_stop`, `after_stop`.
/// Each hook is called at most once.
pub trait StreamChannel {
    /// Acquire the OS resource. Runs before the process exists.
    fn before_start(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Hand the child-facing end of the resource to process creation.
    fn child_stdio(&mut self) -> io::Result<Stdio>;

    /// Runs once the child holds its ends. Parent-side transfer starts here.
    fn after_start(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Finish any transfer before the process is waited on.
    fn before_stop(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Release everything still held.
    fn after_stop(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Standard-input side of a child process
#[derive(Debug)]
pub enum InputChannel {
    Inherit,
    Text(TextSource),
    File(FileSource),
}

impl InputChannel {
    pub fn from_policy(policy: &InputPolicy) -> Self {
        match policy {
            InputPolicy::None => InputChannel::Inherit,
            InputPolicy::Text { text } => InputChannel::Text(TextSource::new(text.clone())),
            InputPolicy::File { path } => InputChannel::File(FileSource::new(path.clone())),
        }
    }
}

impl StreamChannel for InputChannel {
    fn before_start(&mut self) -> io::Result<()> {
        match self {
            InputChannel::Inherit => Ok(()),
            InputChannel::Text(source) => source.before_start(),
            InputChannel::File(source) => source.before_start(),
        }
    }

    fn child_stdio(&mut self) -> io::Result<Stdio> {
        match self {
            InputChannel::Inherit => Ok(Stdio::inherit()),
            InputChannel::Text(source) => source.child_stdio(),
            InputChannel::File(source) => source.child_stdio(),
        }
    }

    fn after_start(&mut self) -> io::Result<()> {
        match self {
            InputChannel::Inherit | InputChannel::File(_) => Ok(()),
            InputChannel::Text(source) => source.after_start(),
        }
    }

    fn before_stop(&mut self) -> io::Result<()> {
        match self {
            InputChannel::Inherit | InputChannel::File(_) => Ok(()),
            InputChannel::Text(source) => source.before_stop(),
        }
    }

    fn after_stop(&mut self) -> io::Result<()> {
        match self {
            InputChannel::Inherit => Ok(()),
            InputChannel::Text(source) => source.after_stop(),
            InputChannel::File(source) => source.after_stop(),
        }
    }
}

/// Standard-output or standard-error side of a child process
#[derive(Debug)]
pub enum OutputChannel {
    Inherit,
    Discard(NullSink),
    Export(FileSink),
    Capture(CaptureSink),
}

impl OutputChannel {
    pub fn from_policy(policy: &OutputPolicy, stream: StreamKind) -> Self {
        match policy {
            OutputPolicy::Inherit => OutputChannel::Inherit,
            OutputPolicy::Discard => OutputChannel::Discard(NullSink::default()),
            OutputPolicy::Export { path, append } => {
                OutputChannel::Export(FileSink::new(path.clone(), *append))
            }
            OutputPolicy::Capture => OutputChannel::Capture(CaptureSink::new(stream)),
        }
    }

    /// Captured bytes, if this channel captures
    pub fn captured(&self) -> Option<&[u8]> {
        match self {
            OutputChannel::Capture(sink) => Some(sink.buffer.as_slice()),
            _ => None,
        }
    }

    pub fn take_captured(&mut self) -> Option<Vec<u8>> {
        match self {
            OutputChannel::Capture(sink) => Some(std::mem::take(&mut sink.buffer)),
            _ => None,
        }
    }
}

impl StreamChannel for OutputChannel {
    fn before_start(&mut self) -> io::Result<()> {
        match self {
            OutputChannel::Inherit => Ok(()),
            OutputChannel::Discard(sink) => sink.before_start(),
            OutputChannel::Export(sink) => sink.before_start(),
            OutputChannel::Capture(sink) => sink.before_start(),
        }
    }

    fn child_stdio(&mut self) -> io::Result<Stdio> {
        match self {
            OutputChannel::Inherit => Ok(Stdio::inherit()),
            OutputChannel::Discard(sink) => sink.child_stdio(),
            OutputChannel::Export(sink) => sink.child_stdio(),
            OutputChannel::Capture(sink) => sink.child_stdio(),
        }
    }

    fn after_start(&mut self) -> io::Result<()> {
        match self {
            OutputChannel::Capture(sink) => sink.after_start(),
            _ => Ok(()),
        }
    }

    fn before_stop(&mut self) -> io::Result<()> {
        match self {
            OutputChannel::Capture(sink) => sink.before_stop(),
            _ => Ok(()),
        }
    }

    fn after_stop(&mut self) -> io::Result<()> {
        match self {
            OutputChannel::Inherit => Ok(()),
            OutputChannel::Discard(sink) => sink.after_stop(),
            OutputChannel::Export(sink) => sink.after_stop(),
            OutputChannel::Capture(sink) => sink.after_stop(),
        }
    }
}

fn not_acquired(what: &str) -> io::Error {
    io::Error::other(format!("{} used before it was acquired", what))
}

/// Files are handed to the child as a duplicate so the channel keeps its own
/// handle until `after_stop`. Pipe ends are moved instead: a parent-side copy
/// of a pipe's write end would keep the reader from ever seeing EOF.
fn duplicate_for_child(file: Option<&File>, what: &str) -> io::Result<Stdio> {
    let file = file.ok_or_else(|| not_acquired(what))?;
    Ok(Stdio::from(file.try_clone()?))
}

/// Literal input delivered through an anonymous pipe
#[derive(Debug)]
pub struct TextSource {
    text: Option<String>,
    reader: Option<PipeReader>,
    writer: Option<PipeWriter>,
    feeder: Option<JoinHandle<io::Result<()>>>,
}

impl TextSource {
    pub fn new(text: String) -> Self {
        Self {
            text: Some(text),
            reader: None,
            writer: None,
            feeder: None,
        }
    }

    fn before_start(&mut self) -> io::Result<()> {
        let (reader, writer) = io::pipe()?;
        self.reader = Some(reader);
        self.writer = Some(writer);
        Ok(())
    }

    fn child_stdio(&mut self) -> io::Result<Stdio> {
        let reader = self.reader.take().ok_or_else(|| not_acquired("input pipe"))?;
        Ok(Stdio::from(reader))
    }

    fn after_start(&mut self) -> io::Result<()> {
        let mut writer = self.writer.take().ok_or_else(|| not_acquired("input pipe"))?;
        let text = self.text.take().unwrap_or_default();

        // The write end is dropped when the thread finishes, which is the
        // child's EOF.
        let feeder = thread::Builder::new()
            .name("stdin-feeder".to_string())
            .spawn(move || {
                writer.write_all(text.as_bytes())?;
                writer.flush()
            })?;
        self.feeder = Some(feeder);
        Ok(())
    }

    fn before_stop(&mut self) -> io::Result<()> {
        let Some(feeder) = self.feeder.take() else {
            return Ok(());
        };

        match feeder.join() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                warn!("Child exited before reading all of its input");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::other("stdin feeder thread panicked")),
        }
    }

    fn after_stop(&mut self) -> io::Result<()> {
        self.reader = None;
        self.writer = None;
        Ok(())
    }
}

/// Input read from a file opened read-only
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    file: Option<File>,
}

impl FileSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    fn before_start(&mut self) -> io::Result<()> {
        debug!(path = %self.path.display(), "Opening input file");
        self.file = Some(File::open(&self.path)?);
        Ok(())
    }

    fn child_stdio(&mut self) -> io::Result<Stdio> {
        duplicate_for_child(self.file.as_ref(), "input file")
    }

    fn after_stop(&mut self) -> io::Result<()> {
        self.file = None;
        Ok(())
    }
}

/// Output sent to the platform null device
#[derive(Debug, Default)]
pub struct NullSink {
    device: Option<File>,
}

impl NullSink {
    fn before_start(&mut self) -> io::Result<()> {
        self.device = Some(OpenOptions::new().write(true).open(NULL_DEVICE)?);
        Ok(())
    }

    fn child_stdio(&mut self) -> io::Result<Stdio> {
        duplicate_for_child(self.device.as_ref(), "null device")
    }

    fn after_stop(&mut self) -> io::Result<()> {
        self.device = None;
        Ok(())
    }
}

/// Output written to a file
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    append: bool,
    file: Option<File>,
}

impl FileSink {
    pub fn new(path: PathBuf, append: bool) -> Self {
        Self {
            path,
            append,
            file: None,
        }
    }

    fn before_start(&mut self) -> io::Result<()> {
        debug!(path = %self.path.display(), append = self.append, "Opening export file");
        let mut options = OpenOptions::new();
        options.create(true);
        if self.append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        self.file = Some(options.open(&self.path)?);
        Ok(())
    }

    fn child_stdio(&mut self) -> io::Result<Stdio> {
        duplicate_for_child(self.file.as_ref(), "export file")
    }

    fn after_stop(&mut self) -> io::Result<()> {
        self.file = None;
        Ok(())
    }
}

/// Output collected into memory through an anonymous pipe.
///
/// The read end is drained on a dedicated thread from `after_start` on, so a
/// child writing more than the pipe buffer never blocks on a parent that is
/// busy elsewhere (waiting, or draining the other stream).
#[derive(Debug)]
pub struct CaptureSink {
    stream: StreamKind,
    reader: Option<PipeReader>,
    writer: Option<PipeWriter>,
    drain: Option<JoinHandle<io::Result<Vec<u8>>>>,
    buffer: Vec<u8>,
}

impl CaptureSink {
    pub fn new(stream: StreamKind) -> Self {
        Self {
            stream,
            reader: None,
            writer: None,
            drain: None,
            buffer: Vec::new(),
        }
    }

    fn before_start(&mut self) -> io::Result<()> {
        let (reader, writer) = io::pipe()?;
        self.reader = Some(reader);
        self.writer = Some(writer);
        Ok(())
    }

    fn child_stdio(&mut self) -> io::Result<Stdio> {
        let writer = self.writer.take().ok_or_else(|| not_acquired("capture pipe"))?;
        Ok(Stdio::from(writer))
    }

    fn after_start(&mut self) -> io::Result<()> {
        let mut reader = self.reader.take().ok_or_else(|| not_acquired("capture pipe"))?;
        let drain = thread::Builder::new()
            .name(format!("{}-drain", self.stream))
            .spawn(move || {
                let mut buffer = Vec::new();
                reader.read_to_end(&mut buffer)?;
                Ok(buffer)
            })?;
        self.drain = Some(drain);
        Ok(())
    }

    fn before_stop(&mut self) -> io::Result<()> {
        let Some(drain) = self.drain.take() else {
            return Ok(());
        };

        let buffer = drain
            .join()
            .map_err(|_| io::Error::other(format!("{} drain thread panicked", self.stream)))??;
        debug!(stream = %self.stream, bytes = buffer.len(), "Capture drained");
        self.buffer = buffer;
        Ok(())
    }

    fn after_stop(&mut self) -> io::Result<()> {
        self.reader = None;
        self.writer = None;
        Ok(())
    }
}
