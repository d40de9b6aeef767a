use crate::demo::{run_demo, DemoArgs};
use crate::server;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use eventstaff::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "eventstaff",
    about = "Run the freelancer document service, its validity sweeper, or a guided demo",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service with the periodic validity sweeper (default command)
    Serve(ServeArgs),
    /// Run one validity sweep against the configured database and print the report
    Sweep(SweepArgs),
    /// Walk through upload, review, reuse, and expiry against an in-memory store
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Do not start the background validity sweeper
    #[arg(long)]
    pub(crate) no_sweeper: bool,
}

#[derive(Args, Debug, Default)]
pub(crate) struct SweepArgs {
    /// Evaluate expiry as of this date (YYYY-MM-DD) instead of now
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) as_of: Option<NaiveDate>,
    /// Print the report as JSON
    #[arg(long)]
    pub(crate) json: bool,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Sweep(args) => server::sweep_once(args),
        Command::Demo(args) => run_demo(args),
    }
}
