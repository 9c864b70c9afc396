mod budget;
mod config;
mod launcher;
mod scanner;
mod session;
mod signals;
mod transcript;
mod verdict;

use clap::Parser;
use config::HarnessConfig;
use std::fmt::Display;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use verdict::Verdict;

/// Boot a guest image under an emulator and pass or fail on whether a
/// marker line shows up on its console before the time budget runs out.
#[derive(Parser, Debug)]
#[command(name = "bootwatch", version, about)]
pub struct Cli {
    /// Image to boot; replaces `{image}` in the command arguments
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    /// Config file path
    #[arg(short, long, default_value = "bootwatch.toml")]
    config: PathBuf,

    /// Marker line prefix that means success (overrides config)
    #[arg(long)]
    marker: Option<String>,

    /// Time budget in seconds (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Polling quantum in milliseconds (overrides config)
    #[arg(long)]
    quantum_ms: Option<u64>,

    /// Emulator program (overrides config)
    #[arg(long)]
    program: Option<String>,

    /// Pass the configured verbose flags to the emulator
    #[arg(long)]
    guest_verbose: bool,

    /// Append child output to this file (overrides config)
    #[arg(long)]
    transcript: Option<PathBuf>,

    /// Debug logging (poll and drain decisions)
    #[arg(short, long)]
    verbose: bool,

    /// Don't echo child output, only the final result
    #[arg(short, long)]
    quiet: bool,

    /// Validate config and print the resolved invocation, don't run
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut HarnessConfig) {
        if let Some(marker) = &self.marker {
            config.scan.marker = marker.clone();
        }
        if let Some(secs) = self.timeout {
            config.scan.budget_secs = secs;
        }
        if let Some(ms) = self.quantum_ms {
            config.scan.poll_quantum_ms = ms;
        }
        if let Some(program) = &self.program {
            config.command.program = program.clone();
        }
        if let Some(path) = &self.transcript {
            config.output.transcript = Some(path.clone());
        }
        if self.quiet {
            config.output.echo = false;
        }
    }
}

/// Report a fatal error on stderr and the final result line on `out`.
fn report_failure(err: &dyn Display, out: &mut impl Write) -> ExitCode {
    eprintln!("error: {err}");
    if let Err(e) = writeln!(out, "{}", Verdict::ProcessExited.message()) {
        tracing::warn!(error = %e, "failed to print result line");
    }
    ExitCode::FAILURE
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "bootwatch=debug"
    } else {
        "bootwatch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match HarnessConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => return report_failure(&e, &mut std::io::stdout()),
    };
    cli.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        return report_failure(&e, &mut std::io::stdout());
    }

    if cli.dry_run {
        let spec = session::build_command(&config.command, &cli.image, cli.guest_verbose);
        println!("command: {spec}");
        println!("marker:  {:?}", config.scan.marker);
        println!("budget:  {}s", config.scan.budget_secs);
        println!("quantum: {}ms", config.scan.poll_quantum_ms);
        println!("Dry run mode — config validated, not running.");
        return ExitCode::SUCCESS;
    }

    let cancel = match signals::CancelFlag::install() {
        Ok(flag) => Some(flag),
        Err(e) => {
            tracing::warn!(error = %e, "failed to install signal handlers, running without cancellation");
            None
        }
    };

    match session::run_session(&config, &cli.image, cli.guest_verbose, cancel).await {
        Ok(result) => {
            tracing::debug!(
                pid = result.pid,
                termination = ?result.termination,
                elapsed_ms = result.report.elapsed.as_millis() as u64,
                "child terminated"
            );
            println!("{}", result.verdict.message());
            ExitCode::from(result.verdict.exit_code() as u8)
        }
        Err(e) => report_failure(&e, &mut std::io::stdout()),
    }
}
