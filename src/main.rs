use clap::{Args, Parser, Subcommand};

use relaymq::{
    config::Config,
    db::PgStore,
    error::Error,
    service::{
        jobs::{DEFAULT_BATCH_SIZE, DEFAULT_SWEEP_LIMIT},
        Service, Sweep,
    },
};

#[derive(Parser)]
#[command(name = "relaymq")]
#[command(about = "Durable task and message queue over PostgreSQL")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API until interrupted
    Listen,

    /// Apply pending database migrations
    Migrate,

    /// Move finalized tasks to the archive
    ArchiveTasks(SweepArgs),

    /// Move delivered and dropped messages to the archive
    ArchiveMessages(SweepArgs),

    /// Retry or finalize items whose processing deadline passed
    ExpireProcessing(SweepArgs),

    /// Make delayed items ready once their time has come
    ResumeDelayed(SweepArgs),
}

#[derive(Args)]
struct SweepArgs {
    /// Rows handled per transaction
    #[arg(long, env = "RELAYMQ_SWEEP_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Rows handled in total by this run
    #[arg(long, env = "RELAYMQ_SWEEP_LIMIT", default_value_t = DEFAULT_SWEEP_LIMIT)]
    limit: usize,
}

impl From<SweepArgs> for Sweep {
    fn from(args: SweepArgs) -> Self {
        Sweep {
            batch_size: args.batch_size,
            limit: args.limit,
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    relaymq::init_tracing()?;

    let config = Config::load()?;

    match cli.command {
        Command::Listen => relaymq::run().config(config).start().await,
        Command::Migrate => {
            let store = PgStore::connect(config.connect_options()?, 1).await?;
            store.migrate().await?;
            tracing::info!("Migrations applied");
            Ok(())
        }
        Command::ArchiveTasks(args) => {
            let service = connect(config).await?;
            report("archive-tasks", service.archive_tasks(args.into()).await)
        }
        Command::ArchiveMessages(args) => {
            let service = connect(config).await?;
            report("archive-messages", service.archive_messages(args.into()).await)
        }
        Command::ExpireProcessing(args) => {
            let service = connect(config).await?;
            report("expire-processing", service.expire_processing(args.into()).await)
        }
        Command::ResumeDelayed(args) => {
            let service = connect(config).await?;
            report("resume-delayed", service.resume_delayed(args.into()).await)
        }
    }
}

async fn connect(config: Config) -> eyre::Result<Service> {
    Service::connect_with().config(config).call().await
}

/// Prints the processed count. A partial count is printed before the failure.
fn report(job: &'static str, result: Result<usize, Error>) -> eyre::Result<()> {
    match result {
        Ok(completed) => {
            println!("{completed}");
            Ok(())
        }
        Err(Error::SweepAborted { completed, source }) => {
            tracing::error!(job, completed, error = %source, "Sweep failed");
            println!("{completed}");
            Err((*source).into())
        }
        Err(e) => Err(e.into()),
    }
}
