//! Command surface for the donation analytics pipeline.
//!
//! [`run_cli`] is the entrypoint used by the `donation-analytics` binary;
//! [`run_analysis`] runs the same pipeline and hands back the
//! [`RunSummary`] without printing it.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use donation_analytics_core::{ProcessorConfig, RepeatPolicy, StreamProcessor};
use donation_analytics_fec::{read_percentile, run_pipeline, ColumnLayout, PipeDelimitedSink, RunSummary};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "donation-analytics")]
#[command(about = "Running percentile of repeat donations in FEC contribution records")]
pub struct Cli {
    /// Pipe-delimited FEC contribution records.
    input: PathBuf,

    /// File whose first line holds the percentile, between 0 and 100.
    percentile_file: PathBuf,

    /// Where repeat-donation rows are written.
    output: PathBuf,

    /// Where the process log (skipped lines, summary) is written. Defaults to stderr.
    log_file: Option<PathBuf>,

    /// Comma-separated header file used to locate columns.
    #[arg(long)]
    header: Option<PathBuf>,

    /// Do not count donations made earlier in the same calendar year as repeat donations.
    #[arg(short, long)]
    strict: bool,

    /// Log every skipped line with the reason it was skipped.
    #[arg(short, long)]
    verbose: bool,

    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

impl Cli {
    #[must_use]
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    #[must_use]
    pub fn policy(&self) -> RepeatPolicy {
        RepeatPolicy::from_strict(self.strict)
    }
}

/// Installs the global tracing subscriber. `RUST_LOG` takes precedence over
/// the default filter.
///
/// # Errors
/// Returns an error when the log file cannot be created or a subscriber is
/// already installed.
pub fn init_tracing(log_file: Option<&Path>, verbose: bool) -> Result<()> {
    let default_filter = if verbose {
        "info,donation_analytics_fec=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed creating log file {}", path.display()))?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()?;
        }
        None => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()?;
        }
    }
    Ok(())
}

/// Runs the pipeline and prints the run summary to stdout.
///
/// # Errors
/// Returns an error when any input cannot be read, the percentile or header
/// is invalid, or the output cannot be written.
pub fn run_cli(cli: Cli) -> Result<()> {
    let summary = run_analysis(&cli)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

/// Runs the pipeline described by `cli`.
///
/// # Errors
/// Same conditions as [`run_cli`].
pub fn run_analysis(cli: &Cli) -> Result<RunSummary> {
    let percentile = read_percentile(&cli.percentile_file)?;
    let layout = match &cli.header {
        Some(path) => ColumnLayout::load(path)?,
        None => ColumnLayout::fec_individual(),
    };
    let policy = cli.policy();

    let input = File::open(&cli.input)
        .with_context(|| format!("failed opening input file {}", cli.input.display()))?;
    let output = File::create(&cli.output)
        .with_context(|| format!("failed creating output file {}", cli.output.display()))?;

    tracing::info!(
        input = %cli.input.display(),
        output = %cli.output.display(),
        percentile = %percentile,
        policy = policy.as_str(),
        "writing recipient|zip|year|percentile|total|count rows"
    );
    if !cli.verbose {
        tracing::info!("use --verbose to log every skipped line");
    }

    let mut processor = StreamProcessor::new(ProcessorConfig { percentile, policy });
    let mut sink = PipeDelimitedSink::new(BufWriter::new(output));
    let summary = run_pipeline(BufReader::new(input), &layout, &mut processor, &mut sink)?;
    sink.into_inner()
        .with_context(|| format!("failed flushing output file {}", cli.output.display()))?;

    Ok(summary)
}

fn print_summary(summary: &RunSummary) {
    println!(
        "lines_read={} valid_records={} skipped_records={} comment_lines={} repeat_donations={} elapsed_ms={:.3}",
        summary.lines_read,
        summary.valid_records,
        summary.skipped_records,
        summary.comment_lines,
        summary.repeat_donations,
        summary.elapsed_ms
    );
}
