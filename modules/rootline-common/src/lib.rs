pub mod types;
pub mod progress;
pub mod config;
pub mod error;

pub use types::*;
pub use progress::*;
pub use config::{Config, DelayWindow, SyncSettings};
pub use error::RootlineError;
