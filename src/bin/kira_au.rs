use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_archive_uploader::app::App;
use kira_archive_uploader::batch::BatchSummary;
use kira_archive_uploader::config::ConfigLoader;
use kira_archive_uploader::error::KiraError;
use kira_archive_uploader::output::JsonOutput;

#[derive(Parser)]
#[command(name = "kira-au")]
#[command(about = "Stage sequencing files in the submission archive")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run every job of an upload plan, one after another")]
    Batch(BatchArgs),
    #[command(about = "Consume upload jobs from the message broker")]
    Listen(ListenArgs),
}

#[derive(Args)]
struct BatchArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    plan: Option<Utf8PathBuf>,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ListenArgs {
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::MissingConfig | KiraError::ConfigRead(_) | KiraError::MissingPlan(_) => 2,
        KiraError::Broker(_) | KiraError::AuthHttp(_) | KiraError::AuthStatus { .. } => 3,
        _ => 1,
    }
}

async fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Batch(args) => run_batch(args).await,
        Commands::Listen(args) => run_listen(args).await,
    }
}

async fn run_batch(args: BatchArgs) -> miette::Result<()> {
    let config = ConfigLoader::resolve(args.config.as_deref())?;
    let app = App::from_config(config)?;
    let summary = app.run_batch(args.plan.as_deref()).await?;
    if args.json {
        JsonOutput::print_summary(&summary).into_diagnostic()?;
    } else {
        print_batch_summary(&summary);
    }
    Ok(())
}

async fn run_listen(args: ListenArgs) -> miette::Result<()> {
    let config = ConfigLoader::resolve(args.config.as_deref())?;
    let app = App::from_config(config)?;
    app.listen().await?;
    Ok(())
}

fn print_batch_summary(summary: &BatchSummary) {
    println!(
        "Finished: {} attempted, {} completed, {} failed",
        summary.attempted,
        summary.completed.len(),
        summary.failed.len()
    );
    for failed in &summary.failed {
        println!("  {} ({}): {}", failed.manifest_id, failed.stage, failed.error);
    }
}
