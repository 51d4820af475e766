use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use flate2::read::MultiGzDecoder;
use tracing::{debug, warn};

use crate::config::DecompressorSpec;
use crate::error::IngestError;
use crate::fasta::{open_sequential, SEQUENTIAL_BUFFER};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CHUNK: usize = 64 * 1024;

type Chunk = io::Result<Vec<u8>>;

/// Reads the standard output of an external decompressor.
///
/// Output is pulled on a helper thread so a decompressor that goes quiet
/// with its output still open fails the read once the timeout passes.
/// The child is killed if the reader is dropped before [`ProcessReader::finish`].
pub struct ProcessReader {
    program: String,
    child: Child,
    chunks: Option<Receiver<Chunk>>,
    pending: Vec<u8>,
    pos: usize,
    timeout: Duration,
    stalled: bool,
}

impl ProcessReader {
    pub fn spawn(spec: &DecompressorSpec, input: &Path) -> Result<Self, IngestError> {
        let program = resolve_program(&spec.program)?;
        debug!(program = %program.display(), input = %input.display(), "starting decompressor");
        let mut child = Command::new(&program)
            .args(&spec.args)
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|err| IngestError::Decompress(format!("{}: {err}", spec.program)))?;
        let chunks = child.stdout.take().map(pump);
        Ok(Self {
            program: spec.program.clone(),
            child,
            chunks,
            pending: Vec::new(),
            pos: 0,
            timeout: spec.timeout,
            stalled: false,
        })
    }

    /// True once a read gave up waiting for output.
    pub fn stalled(&self) -> bool {
        self.stalled
    }

    fn timeout_error(&self) -> IngestError {
        IngestError::DecompressTimeout {
            program: self.program.clone(),
            secs: self.timeout.as_secs(),
        }
    }

    fn kill(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }

    /// Waits for the child to exit, killing it once the timeout passes.
    pub fn finish(mut self) -> Result<(), IngestError> {
        if self.stalled {
            return Err(self.timeout_error());
        }
        // dropping the receiver ends the pump, which closes the pipe
        self.chunks = None;
        let start = Instant::now();
        let status = loop {
            match self.child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() > self.timeout {
                        warn!(program = %self.program, "decompressor did not exit, killing it");
                        self.kill();
                        return Err(self.timeout_error());
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => {
                    return Err(IngestError::Decompress(format!("{}: {err}", self.program)));
                }
            }
        };
        if !status.success() {
            return Err(IngestError::Decompress(format!(
                "{} exited with {status}",
                self.program
            )));
        }
        Ok(())
    }
}

/// Copies the pipe into a bounded channel until EOF, an error, or the
/// receiving side goes away.
fn pump(mut stdout: ChildStdout) -> Receiver<Chunk> {
    let (sender, receiver) = mpsc::sync_channel(4);
    thread::spawn(move || {
        let mut buf = vec![0u8; CHUNK];
        loop {
            let chunk = match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => Ok(buf[..n].to_vec()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => Err(err),
            };
            let failed = chunk.is_err();
            if sender.send(chunk).is_err() || failed {
                break;
            }
        }
    });
    receiver
}

impl Read for ProcessReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.pending.len() {
            let Some(chunks) = self.chunks.as_ref() else {
                return Ok(0);
            };
            match chunks.recv_timeout(self.timeout) {
                Ok(chunk) => {
                    self.pending = chunk?;
                    self.pos = 0;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.chunks = None;
                    return Ok(0);
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(program = %self.program, "decompressor stalled, killing it");
                    self.stalled = true;
                    self.chunks = None;
                    self.kill();
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{} produced no output within {:?}", self.program, self.timeout),
                    ));
                }
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Drop for ProcessReader {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.kill();
        }
    }
}

fn resolve_program(program: &str) -> Result<PathBuf, IngestError> {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err(IngestError::MissingTool(program.to_string()))
        };
    }
    find_in_path(program).ok_or_else(|| IngestError::MissingTool(program.to_string()))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Sequential reader over a reference file that may be gzip-compressed.
pub enum ReferenceReader {
    Plain(BufReader<File>),
    Gzip(BufReader<MultiGzDecoder<File>>),
    Process(BufReader<ProcessReader>),
}

impl ReferenceReader {
    /// The timeout to report in place of a read failure, if the
    /// decompressor stalled.
    pub fn stall_error(&self) -> Option<IngestError> {
        match self {
            ReferenceReader::Process(reader) if reader.get_ref().stalled() => {
                Some(reader.get_ref().timeout_error())
            }
            _ => None,
        }
    }

    /// Reaps the decompressor, if one was started.
    pub fn finish(self) -> Result<(), IngestError> {
        match self {
            ReferenceReader::Process(reader) => reader.into_inner().finish(),
            ReferenceReader::Plain(_) | ReferenceReader::Gzip(_) => Ok(()),
        }
    }
}

impl Read for ReferenceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ReferenceReader::Plain(reader) => reader.read(buf),
            ReferenceReader::Gzip(reader) => reader.read(buf),
            ReferenceReader::Process(reader) => reader.read(buf),
        }
    }
}

impl BufRead for ReferenceReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match self {
            ReferenceReader::Plain(reader) => reader.fill_buf(),
            ReferenceReader::Gzip(reader) => reader.fill_buf(),
            ReferenceReader::Process(reader) => reader.fill_buf(),
        }
    }

    fn consume(&mut self, amount: usize) {
        match self {
            ReferenceReader::Plain(reader) => reader.consume(amount),
            ReferenceReader::Gzip(reader) => reader.consume(amount),
            ReferenceReader::Process(reader) => reader.consume(amount),
        }
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// Opens a reference file for one pass. Gzip input goes through the
/// configured decompressor when there is one, otherwise through an
/// in-process decoder.
pub fn open_reference(
    path: &Path,
    decompressor: Option<&DecompressorSpec>,
) -> Result<ReferenceReader, IngestError> {
    if !is_gzip(path) {
        return Ok(ReferenceReader::Plain(open_sequential(path)?));
    }
    match decompressor {
        Some(spec) => {
            let process = ProcessReader::spawn(spec, path)?;
            Ok(ReferenceReader::Process(BufReader::with_capacity(
                SEQUENTIAL_BUFFER,
                process,
            )))
        }
        None => {
            let file = File::open(path)
                .map_err(|err| IngestError::Filesystem(format!("open {}: {err}", path.display())))?;
            Ok(ReferenceReader::Gzip(BufReader::with_capacity(
                SEQUENTIAL_BUFFER,
                MultiGzDecoder::new(file),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tool_is_reported() {
        let spec = DecompressorSpec {
            program: "definitely-not-a-real-decompressor".to_string(),
            args: vec!["-c".to_string()],
            timeout: Duration::from_secs(1),
        };
        let err = ProcessReader::spawn(&spec, Path::new("x.gz")).err();
        assert!(matches!(err, Some(IngestError::MissingTool(_))));
    }
}
