mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run => commands::run::cmd_run(cli.config).await?,
        Commands::Control { command } => {
            commands::control::cmd_control(cli.config, &command).await?
        }
        Commands::Test { key } => commands::test::cmd_test(cli.config, &key).await?,
    }

    Ok(())
}
