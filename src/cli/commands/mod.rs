pub mod config;
pub mod play;
pub mod riddle;

pub use config::ConfigCommand;
pub use play::PlayCommand;
pub use riddle::RiddleCommand;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Play riddle rounds: guess the answer, get graded
    Play(PlayCommand),
    /// Generate a single riddle
    Riddle(RiddleCommand),
    /// Print the effective configuration
    Config(ConfigCommand),
}
