use clap::Args;

use crate::cli::options::EngineArgs;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(flatten)]
    pub engine: EngineArgs,
}
