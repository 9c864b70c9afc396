/// Bounded line scanner: watch a child's output for a line starting with a
/// marker, within a wall-clock budget.
///
/// Each iteration checks cancellation, the budget, and child liveness, then
/// waits at most one polling quantum for output. Whatever lines are then
/// immediately available are drained in order and tested against the
/// marker; the first hit ends the scan. The budget is charged with all
/// measured wall-clock time since the scan started, checks included.
use crate::budget::TimeBudget;
use crate::launcher::{ChildProcess, ExitProbe, Liveness};
use crate::signals::CancelFlag;
use crate::transcript::Transcript;
use crate::verdict::Verdict;
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Non-empty line prefix that signals success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker(String);

impl Marker {
    /// Returns `None` for an empty marker, which would match every line.
    pub fn new(text: impl Into<String>) -> Option<Self> {
        let text = text.into();
        if text.is_empty() {
            None
        } else {
            Some(Self(text))
        }
    }

    /// Prefix test: the marker must sit at column 0.
    pub fn matches(&self, line: &str) -> bool {
        line.starts_with(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Longest single wait for output or exit.
    pub quantum: Duration,
    pub cancel: Option<CancelFlag>,
}

impl ScanOptions {
    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled)
    }
}

/// Outcome of a scan plus what was observed on the way.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub verdict: Verdict,
    pub elapsed: Duration,
    pub lines_scanned: u64,
    /// Bounded waits performed, one per loop iteration.
    pub polls: u64,
    pub matched_line: Option<String>,
    pub remaining: Duration,
}

/// Scan `child`'s output for `marker` until it matches, `budget` runs out,
/// the child exits, or the scan is cancelled.
///
/// The child is only borrowed; terminating it is the caller's job.
pub async fn wait_for_marker(
    child: &mut ChildProcess,
    marker: &Marker,
    budget: TimeBudget,
    options: &ScanOptions,
    transcript: &mut Transcript,
) -> ScanReport {
    let pid = child.pid();
    let (output, probe) = child.split();
    tracing::debug!(
        pid,
        marker = marker.as_str(),
        budget_ms = budget.total().as_millis() as u64,
        quantum_ms = options.quantum.as_millis() as u64,
        "scanning child output"
    );
    scan(output, probe, marker, budget, options, transcript).await
}

/// Result of one attempt to pull a line off the stream.
enum ReadOutcome {
    Line(String),
    /// Nothing complete within the wait.
    Pending,
    /// End of stream; no further lines will arrive.
    Closed,
    Failed(io::Error),
}

/// Line splitter that survives timed-out reads. Bytes of an unfinished
/// line stay in `pending` until the rest arrives.
struct LineSource<'a, R> {
    reader: &'a mut BufReader<R>,
    pending: Vec<u8>,
    closed: bool,
}

impl<'a, R: AsyncRead + Unpin> LineSource<'a, R> {
    fn new(reader: &'a mut BufReader<R>) -> Self {
        Self {
            reader,
            pending: Vec::new(),
            closed: false,
        }
    }

    /// Wait up to `limit` for the next line. A zero limit only returns
    /// what can be read without blocking.
    async fn next_line(&mut self, limit: Duration) -> ReadOutcome {
        if self.closed {
            return ReadOutcome::Closed;
        }
        let read = self.reader.read_until(b'\n', &mut self.pending);
        match tokio::time::timeout(limit, read).await {
            Err(_) => ReadOutcome::Pending,
            Ok(Err(e)) => ReadOutcome::Failed(e),
            Ok(Ok(0)) => {
                self.closed = true;
                // A partial line left over from an earlier timed-out read.
                if self.pending.is_empty() {
                    ReadOutcome::Closed
                } else {
                    ReadOutcome::Line(self.take_line())
                }
            }
            Ok(Ok(_)) => {
                if self.pending.last() != Some(&b'\n') {
                    // read_until stops short of a newline only at end of stream.
                    self.closed = true;
                }
                ReadOutcome::Line(self.take_line())
            }
        }
    }

    fn take_line(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// What a drain of the stream ended with.
enum Drain {
    Matched(String),
    Exhausted,
    Closed,
    Failed(io::Error),
}

struct Scan<'a, 'r, R> {
    source: LineSource<'r, R>,
    marker: &'a Marker,
    transcript: &'a mut Transcript,
    lines: u64,
}

impl<R: AsyncRead + Unpin> Scan<'_, '_, R> {
    fn check(&mut self, line: String) -> Option<String> {
        self.lines += 1;
        self.transcript.record(&line);
        if self.marker.matches(&line) {
            Some(line)
        } else {
            None
        }
    }

    /// Read lines, waiting at most `first_wait` for the first and not at
    /// all for the rest. Stops at the first matching line, or once
    /// `first_wait` has passed so a flood of output cannot outrun the budget.
    async fn drain(&mut self, first_wait: Duration) -> Drain {
        let deadline = Instant::now() + first_wait;
        let mut wait = first_wait;
        loop {
            match self.source.next_line(wait).await {
                ReadOutcome::Line(line) => {
                    if let Some(hit) = self.check(line) {
                        return Drain::Matched(hit);
                    }
                    if Instant::now() >= deadline {
                        return Drain::Exhausted;
                    }
                }
                ReadOutcome::Pending => return Drain::Exhausted,
                ReadOutcome::Closed => return Drain::Closed,
                ReadOutcome::Failed(e) => return Drain::Failed(e),
            }
            wait = Duration::ZERO;
        }
    }

    /// After exit: scan what the child already left in the pipe. One wait
    /// of at most `limit` for the first line, then only what is immediately
    /// readable, so helpers still writing to the pipe cannot keep it going.
    async fn drain_after_exit(&mut self, limit: Duration) -> Option<String> {
        match self.drain(limit).await {
            Drain::Matched(hit) => Some(hit),
            Drain::Exhausted | Drain::Closed => None,
            Drain::Failed(e) => {
                tracing::debug!(error = %e, "output read failed after exit");
                None
            }
        }
    }
}

/// Charge the budget with everything since `mark` and move `mark` to now,
/// so no time between charges goes unaccounted.
fn charge(budget: &mut TimeBudget, mark: &mut Instant) {
    let now = Instant::now();
    budget.consume(now.duration_since(*mark));
    *mark = now;
}

/// Scan loop over any buffered reader and exit probe.
pub(crate) async fn scan<R, P>(
    output: &mut BufReader<R>,
    probe: &mut P,
    marker: &Marker,
    mut budget: TimeBudget,
    options: &ScanOptions,
    transcript: &mut Transcript,
) -> ScanReport
where
    R: AsyncRead + Unpin,
    P: ExitProbe,
{
    let started = Instant::now();
    let mut scan = Scan {
        source: LineSource::new(output),
        marker,
        transcript,
        lines: 0,
    };
    let mut matched_line = None;
    let mut polls = 0u64;
    let mut mark = started;

    let verdict = loop {
        charge(&mut budget, &mut mark);
        if options.is_cancelled() {
            break Verdict::Cancelled;
        }
        if budget.is_exhausted() {
            break Verdict::TimedOut;
        }

        match probe.liveness() {
            Ok(Liveness::Running) => {}
            Ok(Liveness::Exited(code)) => {
                tracing::debug!(?code, "child exited, draining remaining output");
                let limit = budget.next_wait(options.quantum);
                matched_line = scan.drain_after_exit(limit).await;
                charge(&mut budget, &mut mark);
                break if matched_line.is_some() {
                    Verdict::Matched
                } else {
                    Verdict::ProcessExited
                };
            }
            Err(e) => {
                tracing::warn!(error = %e, "liveness check failed");
                break Verdict::ProcessExited;
            }
        }

        charge(&mut budget, &mut mark);
        let wait = budget.next_wait(options.quantum);
        if wait.is_zero() {
            break Verdict::TimedOut;
        }
        polls += 1;

        if scan.source.closed {
            // Stream is gone: block on exit instead of re-reading EOF.
            let waited = probe.wait_exit(wait).await;
            if let Err(e) = waited {
                tracing::warn!(error = %e, "waiting for child exit failed");
                break Verdict::ProcessExited;
            }
            continue;
        }

        let drained = scan.drain(wait).await;
        charge(&mut budget, &mut mark);
        tracing::trace!(
            remaining_ms = budget.remaining().as_millis() as u64,
            lines = scan.lines,
            "poll complete"
        );

        match drained {
            Drain::Matched(line) => {
                matched_line = Some(line);
                break Verdict::Matched;
            }
            Drain::Exhausted => {}
            Drain::Closed => tracing::debug!("output stream closed"),
            Drain::Failed(e) => {
                tracing::warn!(error = %e, "failed to read child output");
                break Verdict::ProcessExited;
            }
        }
    };

    let report = ScanReport {
        verdict,
        elapsed: started.elapsed(),
        lines_scanned: scan.lines,
        polls,
        matched_line,
        remaining: budget.remaining(),
    };
    tracing::info!(
        verdict = %report.verdict,
        elapsed_ms = report.elapsed.as_millis() as u64,
        lines = report.lines_scanned,
        "scan finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{launch, CommandSpec};
    use tokio::io::AsyncWriteExt;

    /// Exit probe for a child that never exits.
    struct NeverExits;

    impl ExitProbe for NeverExits {
        fn liveness(&mut self) -> io::Result<Liveness> {
            Ok(Liveness::Running)
        }

        async fn wait_exit(&mut self, limit: Duration) -> io::Result<Liveness> {
            tokio::time::sleep(limit).await;
            Ok(Liveness::Running)
        }
    }

    /// Running child whose liveness check itself takes time.
    struct SlowLiveness(Duration);

    impl ExitProbe for SlowLiveness {
        fn liveness(&mut self) -> io::Result<Liveness> {
            std::thread::sleep(self.0);
            Ok(Liveness::Running)
        }

        async fn wait_exit(&mut self, limit: Duration) -> io::Result<Liveness> {
            tokio::time::sleep(limit).await;
            Ok(Liveness::Running)
        }
    }

    fn marker(text: &str) -> Marker {
        Marker::new(text).unwrap()
    }

    fn budget_ms(ms: u64) -> TimeBudget {
        TimeBudget::new(Duration::from_millis(ms)).unwrap()
    }

    fn options_ms(quantum: u64) -> ScanOptions {
        ScanOptions {
            quantum: Duration::from_millis(quantum),
            cancel: None,
        }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    async fn scan_bytes(bytes: &'static [u8], text: &str, budget: u64) -> ScanReport {
        let mut reader = BufReader::new(bytes);
        scan(
            &mut reader,
            &mut NeverExits,
            &marker(text),
            budget_ms(budget),
            &options_ms(20),
            &mut Transcript::silent(),
        )
        .await
    }

    #[test]
    fn test_empty_marker_rejected() {
        assert!(Marker::new("").is_none());
    }

    #[test]
    fn test_marker_is_prefix_match() {
        let m = marker("marker-suffix");
        assert!(m.matches("marker-suffix"));
        assert!(m.matches("marker-suffix-extra-text"));
        assert!(!m.matches("prefix marker-suffix"));
        assert!(!m.matches(" marker-suffix"));
        assert!(!m.matches("marker"));
    }

    #[tokio::test]
    async fn test_prefix_line_matches() {
        let report = scan_bytes(b"marker-suffix-extra-text\n", "marker-suffix", 500).await;
        assert_eq!(report.verdict, Verdict::Matched);
        assert_eq!(
            report.matched_line.as_deref(),
            Some("marker-suffix-extra-text")
        );
    }

    #[tokio::test]
    async fn test_marker_not_at_line_start_does_not_match() {
        let report = scan_bytes(b"prefix marker-suffix\n", "marker-suffix", 200).await;
        assert_eq!(report.verdict, Verdict::TimedOut);
        assert_eq!(report.lines_scanned, 1);
    }

    #[tokio::test]
    async fn test_first_match_wins_and_stops_draining() {
        let report = scan_bytes(b"noise\nBOOT OK first\nBOOT OK second\n", "BOOT OK", 500).await;
        assert_eq!(report.verdict, Verdict::Matched);
        assert_eq!(report.matched_line.as_deref(), Some("BOOT OK first"));
        assert_eq!(report.lines_scanned, 2);
    }

    #[tokio::test]
    async fn test_crlf_and_unterminated_last_line() {
        let report = scan_bytes(b"booting\r\nBOOT OK", "BOOT OK", 500).await;
        assert_eq!(report.verdict, Verdict::Matched);
        assert_eq!(report.matched_line.as_deref(), Some("BOOT OK"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_scanned_lossily() {
        let report = scan_bytes(b"\xff\xfe garbage\nBOOT OK\n", "BOOT OK", 500).await;
        assert_eq!(report.verdict, Verdict::Matched);
        assert_eq!(report.lines_scanned, 2);
    }

    #[tokio::test]
    async fn test_closed_stream_of_live_child_times_out() {
        let started = Instant::now();
        let report = scan_bytes(b"", "BOOT OK", 200).await;
        assert_eq!(report.verdict, Verdict::TimedOut);
        assert_eq!(report.lines_scanned, 0);
        assert_eq!(report.remaining, Duration::ZERO);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_both_lines_in_one_drain() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        writer.write_all(b"not yet\nBOOT OK\n").await.unwrap();
        let mut reader = BufReader::new(reader);

        let report = scan(
            &mut reader,
            &mut NeverExits,
            &marker("BOOT OK"),
            budget_ms(300),
            &options_ms(300),
            &mut Transcript::silent(),
        )
        .await;
        assert_eq!(report.verdict, Verdict::Matched);
        assert_eq!(report.lines_scanned, 2);
        assert_eq!(report.polls, 1);
        drop(writer);
    }

    #[tokio::test]
    async fn test_partial_line_completed_by_later_write() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);
        let feeder = tokio::spawn(async move {
            writer.write_all(b"BOOT").await.unwrap();
            tokio::time::sleep(Duration::from_millis(80)).await;
            writer.write_all(b" OK\n").await.unwrap();
            writer
        });

        let report = scan(
            &mut reader,
            &mut NeverExits,
            &marker("BOOT OK"),
            budget_ms(2000),
            &options_ms(20),
            &mut Transcript::silent(),
        )
        .await;
        assert_eq!(report.verdict, Verdict::Matched);
        assert_eq!(report.matched_line.as_deref(), Some("BOOT OK"));
        assert_eq!(report.lines_scanned, 1);
        drop(feeder.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancellation_checked_before_budget() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let options = ScanOptions {
            quantum: Duration::from_millis(20),
            cancel: Some(cancel),
        };
        let mut reader = BufReader::new(&b"BOOT OK\n"[..]);
        let report = scan(
            &mut reader,
            &mut NeverExits,
            &marker("BOOT OK"),
            budget_ms(500),
            &options,
            &mut Transcript::silent(),
        )
        .await;
        assert_eq!(report.verdict, Verdict::Cancelled);
        assert_eq!(report.lines_scanned, 0);
    }

    #[tokio::test]
    async fn test_child_printing_marker_matches_before_budget() {
        let mut child = launch(&sh("echo starting...; echo BOOT OK; sleep 30")).unwrap();
        let report = wait_for_marker(
            &mut child,
            &marker("BOOT OK"),
            budget_ms(5000),
            &options_ms(100),
            &mut Transcript::silent(),
        )
        .await;
        child.terminate().await;
        assert_eq!(report.verdict, Verdict::Matched);
        assert!(report.elapsed < Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_silent_child_times_out_within_a_quantum() {
        let mut child = launch(&sh("sleep 30")).unwrap();
        let started = Instant::now();
        let report = wait_for_marker(
            &mut child,
            &marker("BOOT OK"),
            budget_ms(600),
            &options_ms(100),
            &mut Transcript::silent(),
        )
        .await;
        let elapsed = started.elapsed();
        child.terminate().await;
        assert_eq!(report.verdict, Verdict::TimedOut);
        assert!(elapsed >= Duration::from_millis(600));
        assert!(elapsed < Duration::from_millis(600 + 100 + 400));
    }

    #[tokio::test]
    async fn test_chatty_child_still_times_out_on_budget() {
        let mut child = launch(&sh("while true; do echo tick; sleep 0.01; done")).unwrap();
        let started = Instant::now();
        let report = wait_for_marker(
            &mut child,
            &marker("BOOT OK"),
            budget_ms(500),
            &options_ms(100),
            &mut Transcript::silent(),
        )
        .await;
        let elapsed = started.elapsed();
        child.terminate().await;
        assert_eq!(report.verdict, Verdict::TimedOut);
        assert!(report.lines_scanned > 0);
        assert!(elapsed < Duration::from_millis(500 + 100 + 400));
    }

    #[tokio::test]
    async fn test_child_exit_before_marker() {
        let mut child = launch(&sh("echo starting...; exit 7")).unwrap();
        let report = wait_for_marker(
            &mut child,
            &marker("BOOT OK"),
            budget_ms(5000),
            &options_ms(100),
            &mut Transcript::silent(),
        )
        .await;
        child.terminate().await;
        assert_eq!(report.verdict, Verdict::ProcessExited);
        assert!(report.elapsed < Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_marker_written_just_before_exit_still_matches() {
        let mut child = launch(&sh("echo BOOT OK; exit 0")).unwrap();
        // Let the child exit before the first liveness check.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let report = wait_for_marker(
            &mut child,
            &marker("BOOT OK"),
            budget_ms(2000),
            &options_ms(100),
            &mut Transcript::silent(),
        )
        .await;
        child.terminate().await;
        assert_eq!(report.verdict, Verdict::Matched);
    }

    #[tokio::test]
    async fn test_closed_output_then_exit_is_process_exited() {
        let mut child = launch(&sh("exec >/dev/null 2>&1; sleep 0.3")).unwrap();
        let report = wait_for_marker(
            &mut child,
            &marker("BOOT OK"),
            budget_ms(5000),
            &options_ms(100),
            &mut Transcript::silent(),
        )
        .await;
        child.terminate().await;
        assert_eq!(report.verdict, Verdict::ProcessExited);
        assert!(report.elapsed < Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_time_spent_in_liveness_checks_is_charged() {
        let mut reader = BufReader::new(&b""[..]);
        let started = Instant::now();
        let report = scan(
            &mut reader,
            &mut SlowLiveness(Duration::from_millis(40)),
            &marker("BOOT OK"),
            budget_ms(200),
            &options_ms(10),
            &mut Transcript::silent(),
        )
        .await;
        assert_eq!(report.verdict, Verdict::TimedOut);
        // Uncharged checks would stretch this to roughly five times the budget.
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_exit_reported_promptly_while_helper_keeps_writing() {
        let mut child = launch(&sh(
            "(while true; do echo tick; sleep 0.05; done) & sleep 0.2; exit 3",
        ))
        .unwrap();
        let report = wait_for_marker(
            &mut child,
            &marker("BOOT OK"),
            budget_ms(4000),
            &options_ms(100),
            &mut Transcript::silent(),
        )
        .await;
        child.terminate().await;
        assert_eq!(report.verdict, Verdict::ProcessExited);
        assert!(report.elapsed < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_marker_printed_by_helper_after_exit_does_not_match() {
        let mut child = launch(&sh(
            "(sleep 0.5; while true; do echo tick; sleep 0.05; done) & \
             (sleep 1.5; echo BOOT OK) & exit 3",
        ))
        .unwrap();
        // The leader is long gone when scanning starts.
        tokio::time::sleep(Duration::from_millis(700)).await;
        let report = wait_for_marker(
            &mut child,
            &marker("BOOT OK"),
            budget_ms(4000),
            &options_ms(100),
            &mut Transcript::silent(),
        )
        .await;
        child.terminate().await;
        assert_eq!(report.verdict, Verdict::ProcessExited);
        assert!(report.matched_line.is_none());
        assert!(report.elapsed < Duration::from_millis(500));
    }
}
