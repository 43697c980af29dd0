// Configuration management module
// TOML settings plus the interactive setup used by `ragchat config`

pub mod interactive;
pub mod settings;


pub use interactive::{run_interactive_config, show_config};
pub use settings::{Config, ConfigError, OllamaConfig, RetrievalConfig};

/// Resolve the configuration directory, preferring an explicit override
#[inline]
pub fn resolve_config_dir(
    override_dir: Option<std::path::PathBuf>,
) -> Result<std::path::PathBuf, ConfigError> {
    override_dir.map_or_else(Config::default_dir, Ok)
}
