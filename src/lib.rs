pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod orchestrator;
pub mod parser;
pub mod runtime;
pub mod session;
pub mod streaming;

// Re-export commonly used types
pub use config::Settings;
pub use error::{Error, LoadError, Result};
pub use orchestrator::{CoreStatus, Exchange, ExchangeOutcome, RiddleCore};
pub use parser::{OutputParser, ParsedReply, ParsedResult};
pub use session::{Role, Session};
pub use streaming::{GenerationOutcome, RequestId, StreamHandle};
