use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = donation_analytics_cli::Cli::parse();
    donation_analytics_cli::init_tracing(cli.log_file(), cli.verbose())?;
    donation_analytics_cli::run_cli(cli)
}
