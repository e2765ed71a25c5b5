//! Shared constants for the riddler core
//!
//! Centralizes output markers and defaults so the parser, the prompts and
//! the terminal frontend agree on them.

/// Textual markers the riddle preamble asks the model to emit
pub mod markers {
    /// Precedes the riddle text
    pub const RIDDLE: &str = "RIDDLE:";

    /// Precedes the answer text
    pub const ANSWER: &str = "ANSWER:";

    /// Completion marker the riddle preamble asks for
    pub const END_RIDDLE: &str = "<END_RIDDLE>";
}

/// Defaults applied when configuration leaves a value unset
pub mod defaults {
    use std::time::Duration;

    /// How often the interactive loop drains pending fragments
    pub const TICK_INTERVAL: Duration = Duration::from_millis(16);

    /// Context window when none is configured
    pub const CONTEXT_SIZE: u32 = 2048;

    /// Prompt batch size for backends that prefill in chunks
    pub const BATCH_SIZE: u32 = 512;
}
