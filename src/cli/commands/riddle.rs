use clap::Args;

use crate::cli::options::EngineArgs;

#[derive(Args)]
pub struct RiddleCommand {
    #[command(flatten)]
    pub engine: EngineArgs,

    /// Print the parsed riddle as JSON instead of streaming it
    #[arg(long)]
    pub json: bool,
}
