pub mod parser;
pub mod types;
pub mod validator;

pub use parser::{parse_config, parse_config_str, parse_connection};
pub use types::OrchestratorConfig;
pub use validator::validate_config;
