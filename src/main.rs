use beacon::{
    cmd::{RouteArgs, route},
    context::AppContextBuilder,
    supervisor::Supervisor,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding `app.yaml` and the resource files.
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the alert routing and escalation engine.
    Run,
    /// Shows which route, chain and grouping key a payload would get.
    Route(RouteArgs),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber =
        FmtSubscriber::builder().with_env_filter(EnvFilter::from_default_env()).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run_supervisor(cli.config_dir).await?,
        Commands::Route(args) => route::execute(cli.config_dir, args).await?,
    }

    Ok(())
}

async fn run_supervisor(config_dir: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let context = AppContextBuilder::new(config_dir).build().await?;
    tracing::info!("Application state initialized.");

    let supervisor = Supervisor::builder()
        .config(context.config)
        .state(context.repo)
        .metrics(context.metrics)
        .clock(context.clock)
        .evaluator(context.evaluator)
        .build()
        .await?;

    tracing::info!("Supervisor initialized, starting engine...");
    supervisor.run().await?;

    Ok(())
}
