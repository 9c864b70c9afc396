/// Outcome of one marker scan and its mapping onto a process exit code.
use std::fmt;

/// Final state of a scan. Every scan produces exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// A line starting with the marker was seen.
    Matched,
    /// The budget ran out before the marker appeared.
    TimedOut,
    /// The child exited (or its output broke) before the marker appeared.
    ProcessExited,
    /// SIGINT/SIGTERM arrived while scanning.
    Cancelled,
}

impl Verdict {
    pub fn is_success(self) -> bool {
        matches!(self, Verdict::Matched)
    }

    /// 0 for `Matched`, 1 for everything else.
    pub fn exit_code(self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// The single user-facing result line.
    pub fn message(self) -> &'static str {
        if self.is_success() {
            "Success"
        } else {
            "Failure"
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Matched => "matched",
            Verdict::TimedOut => "timed out",
            Verdict::ProcessExited => "process exited",
            Verdict::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
