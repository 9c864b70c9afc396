/// Process launcher: start the guest command and own its lifecycle.
///
/// The child runs in its own process group with stdout and stderr sharing
/// one pipe, so the scanner sees a single ordered byte stream. Stdin is
/// piped and kept open for callers that want to talk to the guest console.
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, Command};

/// Upper bound on reaping the leader after SIGKILL.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Combined stdout+stderr of a launched child.
pub type OutputStream = BufReader<pipe::Receiver>;

/// A fully resolved invocation: program plus its argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Errors that prevent a child from starting at all.
#[derive(Debug)]
pub enum LaunchError {
    /// The executable could not be resolved.
    NotFound { program: String },
    /// The OS refused to create the process.
    Spawn {
        program: String,
        source: io::Error,
    },
    /// The output pipe could not be set up.
    Pipe { source: io::Error },
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchError::NotFound { program } => {
                write!(f, "executable not found: {program}")
            }
            LaunchError::Spawn { program, source } => {
                write!(f, "failed to spawn {program}: {source}")
            }
            LaunchError::Pipe { source } => {
                write!(f, "failed to set up output pipe: {source}")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::NotFound { .. } => None,
            LaunchError::Spawn { source, .. } => Some(source),
            LaunchError::Pipe { source } => Some(source),
        }
    }
}

/// Whether the child is still running. The code is `None` when it was
/// killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(Option<i32>),
}

/// What `ChildProcess::terminate` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The child had already exited; nothing was killed.
    AlreadyExited(Option<i32>),
    /// The child was running and its process group was killed.
    Killed,
}

/// Non-blocking and bounded exit checks, the only synchronisation the
/// scanner has with the child.
#[allow(async_fn_in_trait)]
pub trait ExitProbe {
    /// Check liveness without blocking.
    fn liveness(&mut self) -> io::Result<Liveness>;

    /// Wait at most `limit` for the child to exit.
    async fn wait_exit(&mut self, limit: Duration) -> io::Result<Liveness>;
}

/// Process handle plus cached exit status.
#[derive(Debug)]
pub struct ProcessState {
    child: Child,
    pgid: Pid,
    exit: Option<ExitStatus>,
}

impl ProcessState {
    fn record(&mut self, status: ExitStatus) -> Liveness {
        self.exit = Some(status);
        Liveness::Exited(status.code())
    }

    /// SIGKILL the whole group. A group that is already gone is fine.
    fn kill_group(&self) {
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                tracing::warn!(pgid = %self.pgid, error = %e, "failed to kill process group");
            }
        }
    }
}

impl ExitProbe for ProcessState {
    fn liveness(&mut self) -> io::Result<Liveness> {
        if let Some(status) = self.exit {
            return Ok(Liveness::Exited(status.code()));
        }
        match self.child.try_wait()? {
            Some(status) => Ok(self.record(status)),
            None => Ok(Liveness::Running),
        }
    }

    async fn wait_exit(&mut self, limit: Duration) -> io::Result<Liveness> {
        if let Some(status) = self.exit {
            return Ok(Liveness::Exited(status.code()));
        }
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(status) => Ok(self.record(status?)),
            Err(_) => Ok(Liveness::Running),
        }
    }
}

/// One launched guest. Dropping it without `terminate` still kills the
/// process group.
#[derive(Debug)]
pub struct ChildProcess {
    pid: u32,
    output: OutputStream,
    stdin: Option<ChildStdin>,
    state: ProcessState,
    terminated: bool,
}

impl ChildProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Writable stdin of the child, until termination closes it.
    #[allow(dead_code)]
    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    #[allow(dead_code)]
    pub fn liveness(&mut self) -> io::Result<Liveness> {
        self.state.liveness()
    }

    /// Borrow the output stream and the exit probe at the same time.
    pub fn split(&mut self) -> (&mut OutputStream, &mut ProcessState) {
        (&mut self.output, &mut self.state)
    }

    /// Force-terminate the child and its process group.
    ///
    /// Idempotent: a child that already exited, or was terminated before,
    /// reports `AlreadyExited` and nothing is signalled twice.
    pub async fn terminate(&mut self) -> Termination {
        self.stdin.take();

        if self.terminated {
            return Termination::AlreadyExited(self.state.exit.and_then(|s| s.code()));
        }
        self.terminated = true;

        let liveness = match self.state.liveness() {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "liveness check failed before kill");
                Liveness::Running
            }
        };

        // Leftover helpers may still hold the group even when the leader exited.
        self.state.kill_group();

        match liveness {
            Liveness::Exited(code) => {
                tracing::debug!(pid = self.pid, ?code, "child already exited");
                Termination::AlreadyExited(code)
            }
            Liveness::Running => {
                match tokio::time::timeout(REAP_TIMEOUT, self.state.child.wait()).await {
                    Ok(Ok(status)) => {
                        self.state.record(status);
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(pid = self.pid, error = %e, "failed to reap killed child");
                    }
                    Err(_) => {
                        tracing::warn!(pid = self.pid, "killed child was not reaped in time");
                    }
                }
                tracing::info!(pid = self.pid, "child process group killed");
                Termination::Killed
            }
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if !self.terminated {
            // The leader may be gone while helpers in its group still run.
            tracing::warn!(pid = self.pid, "child dropped without terminate, killing process group");
            self.state.kill_group();
        }
    }
}

fn spawn_error(program: &str, source: io::Error) -> LaunchError {
    if source.kind() == io::ErrorKind::NotFound {
        LaunchError::NotFound {
            program: program.to_string(),
        }
    } else {
        LaunchError::Spawn {
            program: program.to_string(),
            source,
        }
    }
}

/// Start `spec` as a child process without waiting for it.
///
/// Must be called from within a tokio runtime.
pub fn launch(spec: &CommandSpec) -> Result<ChildProcess, LaunchError> {
    let (reader, writer) = io::pipe().map_err(|e| LaunchError::Pipe { source: e })?;
    let writer_stderr = writer
        .try_clone()
        .map_err(|e| LaunchError::Pipe { source: e })?;
    let receiver = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))
        .map_err(|e| LaunchError::Pipe { source: e })?;

    tracing::info!(command = %spec, "launching child");

    // The command holds our copies of the write end; it must be dropped
    // right after spawning or the stream never reaches end-of-file.
    let mut child = {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(writer_stderr))
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true);
        command
            .spawn()
            .map_err(|e| spawn_error(&spec.program, e))?
    };

    let pid = match child.id() {
        Some(pid) => pid,
        None => {
            return Err(LaunchError::Spawn {
                program: spec.program.clone(),
                source: io::Error::other("child reaped before its pid was read"),
            })
        }
    };
    let stdin = child.stdin.take();
    tracing::info!(pid, "child process started");

    Ok(ChildProcess {
        pid,
        output: BufReader::new(receiver),
        stdin,
        state: ProcessState {
            child,
            pgid: Pid::from_raw(pid as i32),
            exit: None,
        },
        terminated: false,
    })
}
