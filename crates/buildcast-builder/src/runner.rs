//! Build process execution.

use crate::error::BuildError;
use buildcast_types::StreamKind;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// Largest chunk handed out by [`OutputStream::next_chunk`].
pub const CHUNK_SIZE: usize = 1024;

/// Starts build commands through a shell.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    shell: PathBuf,
}

impl ProcessRunner {
    pub fn new(shell: impl AsRef<Path>) -> Self {
        Self {
            shell: shell.as_ref().to_path_buf(),
        }
    }

    /// Runs `<shell> -c <command>` in `working_dir`.
    ///
    /// The child is killed if its [`Completion`] is dropped before the
    /// process exits.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Spawn`] if the process cannot be started, for
    /// example because `working_dir` does not exist.
    pub fn spawn(&self, working_dir: &Path, command: &str) -> Result<RunningProcess, BuildError> {
        let spawn_error = |source| BuildError::Spawn {
            dir: working_dir.to_path_buf(),
            source,
        };

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("stdout was not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("stderr was not captured")))?;

        tracing::debug!(pid = child.id(), command = %command, "build process started");

        Ok(RunningProcess {
            stdout: OutputStream::new(stdout, StreamKind::Stdout),
            stderr: OutputStream::new(stderr, StreamKind::Stderr),
            completion: Completion { child },
        })
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

/// A started build process.
#[derive(Debug)]
pub struct RunningProcess {
    stdout: OutputStream<ChildStdout>,
    stderr: OutputStream<ChildStderr>,
    completion: Completion,
}

impl RunningProcess {
    /// Splits the process into its two output streams and its exit handle,
    /// so each can be driven by its own task.
    pub fn into_parts(
        self,
    ) -> (
        OutputStream<ChildStdout>,
        OutputStream<ChildStderr>,
        Completion,
    ) {
        (self.stdout, self.stderr, self.completion)
    }
}

/// Lazy producer of output chunks from one stream of a process.
///
/// Chunks come out in the order the process wrote them. The I/O layer may
/// split or coalesce writes, so chunks do not align with lines.
#[derive(Debug)]
pub struct OutputStream<R> {
    reader: R,
    kind: StreamKind,
    finished: bool,
}

impl<R: AsyncRead + Unpin> OutputStream<R> {
    pub fn new(reader: R, kind: StreamKind) -> Self {
        Self {
            reader,
            kind,
            finished: false,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Reads the next chunk of at most [`CHUNK_SIZE`] bytes.
    ///
    /// Returns `None` at end of stream. A read error also ends the stream;
    /// it is logged rather than returned since the process exit status is
    /// what decides the build result.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        if self.finished {
            return None;
        }
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match self.reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    buf.truncate(n);
                    return Some(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(stream = self.kind.as_str(), "failed to read build output: {}", e);
                    break;
                }
            }
        }
        self.finished = true;
        None
    }
}

/// Exit handle of a build process.
#[derive(Debug)]
pub struct Completion {
    child: Child,
}

impl Completion {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the process to exit.
    pub async fn wait(mut self) -> Result<ExitStatus, BuildError> {
        self.child.wait().await.map_err(BuildError::Wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain<R: AsyncRead + Unpin>(mut stream: OutputStream<R>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next_chunk().await {
            assert!(!chunk.is_empty());
            assert!(chunk.len() <= CHUNK_SIZE);
            out.extend(chunk);
        }
        out
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let process = ProcessRunner::default()
            .spawn(dir.path(), "echo out; echo err >&2; exit 3")
            .unwrap();
        let (stdout, stderr, completion) = process.into_parts();
        assert_eq!(stdout.kind(), StreamKind::Stdout);
        assert_eq!(stderr.kind(), StreamKind::Stderr);
        // Not reaped yet, so the pid is still known.
        assert!(completion.id().is_some());

        let (out, err) = tokio::join!(drain(stdout), drain(stderr));
        let status = completion.wait().await.unwrap();

        assert_eq!(out, b"out\n");
        assert_eq!(err, b"err\n");
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let (stdout, _stderr, completion) = ProcessRunner::default()
            .spawn(dir.path(), "cat marker.txt")
            .unwrap()
            .into_parts();

        assert_eq!(drain(stdout).await, b"here");
        assert!(completion.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn large_output_is_chunked_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (stdout, _stderr, completion) = ProcessRunner::default()
            .spawn(dir.path(), "seq 1 2000")
            .unwrap()
            .into_parts();

        let out = drain(stdout).await;
        let expected: String = (1..=2000).map(|i| format!("{i}\n")).collect();
        assert_eq!(String::from_utf8(out).unwrap(), expected);
        assert!(completion.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn missing_working_directory_is_a_spawn_error() {
        let result = ProcessRunner::default().spawn(Path::new("/definitely/not/here"), "true");
        assert!(matches!(result, Err(BuildError::Spawn { .. })));
    }
}
