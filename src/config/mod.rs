// Configuration management module
// One validated, immutable structure loaded at startup and shared with every component


pub mod settings;

pub use settings::{
    API_KEY_ENV, Config, ConfigError, EmbeddingConfig, GenerationBackend, GenerationConfig,
};

const MASKED_API_KEY: &str = "********";

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}

/// The effective configuration as TOML, with the API key masked
#[inline]
pub fn render_config(config: &Config) -> anyhow::Result<String> {
    let mut printable = config.clone();
    if printable.generation.api_key.is_some() {
        printable.generation.api_key = Some(MASKED_API_KEY.to_string());
    }
    Ok(toml::to_string_pretty(&printable)?)
}

/// Print the effective configuration, with the API key masked
#[inline]
pub fn show_config(config: &Config) -> anyhow::Result<()> {
    println!("# {}", config.config_file_path().display());
    println!("{}", render_config(config)?);
    Ok(())
}
