pub mod clienv;
pub mod config;
pub mod daemon;
pub mod error;
pub mod itemkey;
pub mod plugin;
pub mod protocol;
pub mod scheduler;
pub mod value;

pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use protocol::MessageFrame;
pub use scheduler::{LocalScheduler, Scheduler};
