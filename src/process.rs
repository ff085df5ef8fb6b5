use std::ffi::OsStr;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Bytes of output kept per stream. Older output is discarded.
const OUTPUT_TAIL_LIMIT: usize = 64 * 1024;

/// How long output readers may keep running after the process exited
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    TimedOut {
        program: String,
        timeout: Duration,
        output: String,
    },

    #[error("process has already exited")]
    AlreadyExited,

    #[error("failed to signal process: {0}")]
    Signal(#[source] io::Error),
}

/// Exit status plus the combined (stdout, then stderr) output tail
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub output: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Owns one external process from spawn until it has been reaped.
///
/// The child is spawned with `kill_on_drop`, so dropping a handle on any path
/// (including a cancelled task) terminates the process instead of leaking it.
pub struct ProcessHandle {
    program: String,
    child: Child,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

/// Start `program` with `args`, capturing both output streams.
pub fn start<P, I, S>(program: P, args: I) -> Result<ProcessHandle, ProcessError>
where
    P: AsRef<OsStr>,
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let name = program.to_string_lossy().into_owned();

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: name.clone(),
            source,
        })?;

    let stdout = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(read_tail(pipe, OUTPUT_TAIL_LIMIT)));
    let stderr = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(read_tail(pipe, OUTPUT_TAIL_LIMIT)));

    tracing::debug!(program = %name, pid = ?child.id(), "Process started");

    Ok(ProcessHandle {
        program: name,
        child,
        stdout,
        stderr,
    })
}

/// Run a short-lived process to completion, killing it if `timeout` elapses.
pub async fn run_sync<P, I, S>(
    program: P,
    args: I,
    timeout: Duration,
) -> Result<ProcessOutput, ProcessError>
where
    P: AsRef<OsStr>,
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut handle = start(program, args)?;

    let waited = tokio::time::timeout(timeout, handle.exited()).await;
    match waited {
        Ok(status) => {
            let status = status?;
            Ok(handle.finish(status).await)
        }
        Err(_) => {
            tracing::warn!(program = %handle.program, ?timeout, "Process timed out, killing it");
            handle.kill().await;
            let output = handle.collect_output().await;
            Err(ProcessError::TimedOut {
                program: handle.program,
                timeout,
                output,
            })
        }
    }
}

impl ProcessHandle {
    /// OS process id, `None` once the process has been reaped
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the process to exit. Cancel safe, so it can sit in `select!`.
    pub async fn exited(&mut self) -> Result<ExitStatus, ProcessError> {
        let status = self.child.wait().await.map_err(|source| ProcessError::Wait {
            program: self.program.clone(),
            source,
        })?;

        tracing::debug!(program = %self.program, %status, "Process exited");
        Ok(status)
    }

    /// Wait for exit and collect the captured output.
    pub async fn wait(mut self) -> Result<ProcessOutput, ProcessError> {
        let status = self.exited().await?;
        Ok(self.finish(status).await)
    }

    /// Turn an already observed exit status into the full output record.
    pub async fn finish(mut self, status: ExitStatus) -> ProcessOutput {
        let output = self.collect_output().await;
        ProcessOutput { status, output }
    }

    /// Ask the process to stop gracefully (SIGINT), letting it flush its output.
    #[cfg(unix)]
    pub fn interrupt(&mut self) -> Result<(), ProcessError> {
        let pid = self.child.id().ok_or(ProcessError::AlreadyExited)?;
        let pid = libc::pid_t::try_from(pid).map_err(|_| ProcessError::AlreadyExited)?;

        // SAFETY: `pid` is our own child and has not been reaped yet, so it
        // cannot refer to an unrelated process.
        let rc = unsafe { libc::kill(pid, libc::SIGINT) };
        if rc != 0 {
            return Err(ProcessError::Signal(io::Error::last_os_error()));
        }

        tracing::debug!(program = %self.program, pid, "Sent SIGINT");
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn interrupt(&mut self) -> Result<(), ProcessError> {
        if self.child.id().is_none() {
            return Err(ProcessError::AlreadyExited);
        }
        self.child.start_kill().map_err(ProcessError::Signal)
    }

    /// Kill the process and reap it.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(program = %self.program, "Failed to kill process: {}", e);
        }
    }

    async fn collect_output(&mut self) -> String {
        let mut combined = Vec::new();

        for mut reader in [self.stdout.take(), self.stderr.take()].into_iter().flatten() {
            match tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut reader).await {
                Ok(Ok(bytes)) => combined.extend_from_slice(&bytes),
                Ok(Err(e)) => tracing::warn!(program = %self.program, "Output reader failed: {}", e),
                Err(_) => {
                    tracing::warn!(program = %self.program, "Output still open after exit, dropping it");
                    reader.abort();
                }
            }
        }

        String::from_utf8_lossy(&combined).into_owned()
    }
}

async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit {
                    let excess = tail.len() - limit;
                    tail.drain(..excess);
                }
            }
        }
    }

    tail
}
