//! YAML settings for the checkpoint flusher.

pub mod parser;
pub mod types;
pub mod validator;

pub use parser::{parse_settings, parse_settings_str};
pub use types::{PersistenceSettings, RetrySettings};
pub use validator::validate_settings;
