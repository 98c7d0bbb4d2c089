use clap::{Args, Parser, Subcommand};
use serde_json::json;

use einvoice::error::AppError;

use crate::server;

#[derive(Parser, Debug)]
#[command(
    name = "Invoice Reconciliation Service",
    about = "Run the e-invoicing status reconciliation service from the command line",
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
    /// Trigger a polling sweep on a running service instance
    Poll(PollArgs),
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

#[derive(Args, Debug)]
pub(crate) struct PollArgs {
    /// Base URL of the running service
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    pub(crate) url: String,
    /// Merchant to sweep
    #[arg(long)]
    pub(crate) merchant: String,
    /// Use the registry's bulk updates endpoint instead of per-invoice polls
    #[arg(long)]
    pub(crate) official: bool,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Poll(args) => run_poll(args).await,
    }
}

/// Hits the on-demand sweep endpoint of a running instance and prints the
/// summary, so operators can trigger reconciliation without extra tooling.
async fn run_poll(args: PollArgs) -> Result<(), AppError> {
    let mode = if args.official { "official" } else { "legacy" };
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/v1/polling/run", args.url.trim_end_matches('/')))
        .json(&json!({ "merchant_id": args.merchant, "mode": mode }))
        .send()
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, err))?;

    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;

    let rendered = serde_json::to_string_pretty(&body)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    println!("{rendered}");

    if !status.is_success() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("sweep request failed with {status}"),
        )
        .into());
    }
    Ok(())
}
