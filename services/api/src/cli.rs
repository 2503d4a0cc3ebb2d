use crate::commands::{run_analyze, run_calibrate, AnalyzeArgs, CalibrateArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use ordinal_valuation::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "Ordinal Valuation",
    about = "Value a subject property by ranking it against comparable sales",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Run one analysis from CSV records and a JSON variable list
    Analyze(AnalyzeArgs),
    /// Fit weights to historical outcomes and write a calibrated weight artifact
    Calibrate(CalibrateArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Analyze(args) => run_analyze(args),
        Command::Calibrate(args) => run_calibrate(args),
    }
}
