/// Single supervised run: build the emulator invocation, launch it, scan
/// its output for the boot marker, and terminate it whatever the outcome.
use crate::budget::TimeBudget;
use crate::config::{CommandConfig, HarnessConfig};
use crate::launcher::{self, CommandSpec, LaunchError, Termination};
use crate::scanner::{self, Marker, ScanOptions, ScanReport};
use crate::signals::CancelFlag;
use crate::transcript::{Transcript, TranscriptError};
use crate::verdict::Verdict;
use std::path::Path;

/// Result of a completed session.
#[derive(Debug)]
pub struct SessionResult {
    pub verdict: Verdict,
    pub report: ScanReport,
    /// What terminating the child found.
    pub termination: Termination,
    /// Child PID (for logging/diagnostics).
    pub pid: u32,
}

/// Errors that stop a session before any scan outcome exists.
#[derive(Debug)]
pub enum SessionError {
    /// Failed to start the child.
    Launch(LaunchError),
    /// Failed to open the transcript file.
    Transcript(TranscriptError),
    /// Marker or budget unusable.
    Invalid(&'static str),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Launch(e) => write!(f, "launch failed: {e}"),
            SessionError::Transcript(e) => write!(f, "{e}"),
            SessionError::Invalid(msg) => write!(f, "invalid session settings: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Launch(e) => Some(e),
            SessionError::Transcript(e) => Some(e),
            SessionError::Invalid(_) => None,
        }
    }
}

impl From<LaunchError> for SessionError {
    fn from(e: LaunchError) -> Self {
        SessionError::Launch(e)
    }
}

impl From<TranscriptError> for SessionError {
    fn from(e: TranscriptError) -> Self {
        SessionError::Transcript(e)
    }
}

/// Build the command arguments, replacing `{image}` placeholders with the image path.
fn build_args(command: &CommandConfig, image: &Path, guest_verbose: bool) -> Vec<String> {
    let image = image.display().to_string();
    let extra: &[String] = if guest_verbose {
        command.verbose_args.as_slice()
    } else {
        &[]
    };
    command
        .args
        .iter()
        .chain(extra)
        .map(|arg| arg.replace("{image}", &image))
        .collect()
}

/// Resolve the full invocation for `image`.
pub fn build_command(command: &CommandConfig, image: &Path, guest_verbose: bool) -> CommandSpec {
    CommandSpec {
        program: command.program.clone(),
        args: build_args(command, image, guest_verbose),
    }
}

/// Launch the emulator on `image`, wait for the boot marker, and kill the
/// child on every path out.
///
/// Only launch and transcript setup fail; every scan outcome, including
/// cancellation, comes back as a `SessionResult`.
pub async fn run_session(
    config: &HarnessConfig,
    image: &Path,
    guest_verbose: bool,
    cancel: Option<CancelFlag>,
) -> Result<SessionResult, SessionError> {
    let marker = Marker::new(config.scan.marker.as_str())
        .ok_or(SessionError::Invalid("empty marker"))?;
    let budget =
        TimeBudget::new(config.scan.budget()).ok_or(SessionError::Invalid("zero budget"))?;
    if config.scan.quantum().is_zero() {
        return Err(SessionError::Invalid("zero polling quantum"));
    }
    let options = ScanOptions {
        quantum: config.scan.quantum(),
        cancel,
    };

    let mut transcript = match &config.output.transcript {
        Some(path) => Transcript::open(path, config.output.echo)?,
        None => Transcript::console(config.output.echo),
    };

    let spec = build_command(&config.command, image, guest_verbose);
    let mut child = launcher::launch(&spec)?;
    let pid = child.pid();

    let report =
        scanner::wait_for_marker(&mut child, &marker, budget, &options, &mut transcript).await;
    let termination = child.terminate().await;
    transcript.finish();

    tracing::info!(
        pid,
        verdict = %report.verdict,
        ?termination,
        elapsed_ms = report.elapsed.as_millis() as u64,
        remaining_ms = report.remaining.as_millis() as u64,
        lines = report.lines_scanned,
        polls = report.polls,
        matched = ?report.matched_line,
        "session completed"
    );

    Ok(SessionResult {
        verdict: report.verdict,
        report,
        termination,
        pid,
    })
}
