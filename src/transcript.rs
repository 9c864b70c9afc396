/// Echo of child output lines: to stdout for the operator and, optionally,
/// appended to a log file.
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Failed to open the transcript file.
#[derive(Debug)]
pub struct TranscriptError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

impl std::fmt::Display for TranscriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to open transcript {}: {}",
            self.path.display(),
            self.source
        )
    }
}

impl std::error::Error for TranscriptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

pub struct Transcript {
    echo: bool,
    file: Option<(PathBuf, BufWriter<File>)>,
}

impl Transcript {
    /// Echo to stdout only (or nowhere when `echo` is false).
    pub fn console(echo: bool) -> Self {
        Self { echo, file: None }
    }

    /// Discard everything.
    #[cfg(test)]
    pub fn silent() -> Self {
        Self::console(false)
    }

    /// Echo to stdout and append every line to `path`.
    pub fn open(path: &Path, echo: bool) -> Result<Self, TranscriptError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TranscriptError {
                path: path.to_path_buf(),
                source: e,
            })?;
        Ok(Self {
            echo,
            file: Some((path.to_path_buf(), BufWriter::new(file))),
        })
    }

    /// Record one child line. File errors are logged once and the file is
    /// dropped; they never affect the scan.
    pub fn record(&mut self, line: &str) {
        if self.echo {
            println!("{line}");
        }
        let failed = match &mut self.file {
            Some((path, writer)) => match writeln!(writer, "{line}") {
                Ok(()) => false,
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "transcript write failed, disabling");
                    true
                }
            },
            None => false,
        };
        if failed {
            self.file = None;
        }
    }

    pub fn finish(&mut self) {
        if let Some((path, writer)) = &mut self.file {
            if let Err(e) = writer.flush() {
                tracing::warn!(error = %e, path = %path.display(), "failed to flush transcript");
            }
        }
    }
}

impl Drop for Transcript {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_transcript_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("boot.log");
        std::fs::write(&path, "previous run\n").unwrap();

        let mut transcript = Transcript::open(&path, false).unwrap();
        transcript.record("starting...");
        transcript.record("BOOT OK");
        transcript.finish();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "previous run\nstarting...\nBOOT OK\n");
    }

    #[test]
    fn test_transcript_open_bad_path() {
        let err = Transcript::open(Path::new("/nonexistent-dir/impossible/boot.log"), false)
            .err()
            .unwrap();
        assert!(err.to_string().contains("failed to open transcript"));
    }
}
