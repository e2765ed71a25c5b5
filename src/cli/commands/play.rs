use clap::Args;

use crate::cli::options::EngineArgs;

#[derive(Args)]
pub struct PlayCommand {
    #[command(flatten)]
    pub engine: EngineArgs,

    /// Stop after this many rounds (0 plays until you quit)
    #[arg(short, long, default_value_t = 0)]
    pub rounds: u32,
}
