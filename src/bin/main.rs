//! Riddler binary.
//!
//! Terminal frontend for the riddle game: a local model invents riddles,
//! the player answers, and a second session of the same model grades them.

use clap::Parser;
use riddler_core::cli::{
    commands::Commands,
    handle_config, handle_play, handle_riddle, init_logging, Cli,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli.logging)?;

    tracing::debug!("Riddler starting up");

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Play(cmd) => handle_play(config, &cmd.engine, cmd.rounds).await?,
        Commands::Riddle(cmd) => handle_riddle(config, &cmd.engine, cmd.json).await?,
        Commands::Config(cmd) => handle_config(config, &cmd.engine)?,
    }

    Ok(())
}
