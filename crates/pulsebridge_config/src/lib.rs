//! Layered configuration.
//!
//! Sources, lowest priority first:
//! 1. `Settings::default()`
//! 2. `config/default.{toml,yaml,json,...}` relative to the working directory (optional)
//! 3. `PULSEBRIDGE__<SECTION>__<KEY>` environment variables, e.g.
//!    `PULSEBRIDGE__CLIENT__SERVICE_URL`. `PULSEBRIDGE__BROKER__NAMESPACES`
//!    takes a comma separated list.

pub mod settings;


use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use crate::settings::PartialSettings;

pub use settings::{
    BrokerSettings, ClientSettings, ConsumerSettings, LoggingSettings, ProducerSettings, Settings,
};

const ENV_PREFIX: &str = "PULSEBRIDGE";

/// Load settings from `config/default` and the environment, merged over defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    build(File::with_name("config/default").required(false))
}

/// Load settings from an explicit file (its extension picks the format),
/// still letting the environment override it.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    build(File::from(path.as_ref()).required(true))
}

fn build<S>(file: S) -> Result<Settings, ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("broker.namespaces"),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge(Settings::default()))
}
