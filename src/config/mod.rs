//! Configuration for the watch engine and its host process.
//!
//! Values are merged from several sources, later ones overriding earlier:
//! 1. Hardcoded defaults
//! 2. Configuration file named by `CONFIG_PATH`
//! 3. Explicit override file (`with_override_config`)
//! 4. Environment variables prefixed with `REVWATCH__`
//!    (e.g. `REVWATCH__WATCH__WATCHER_BUFFER_SIZE=64`)
mod monitoring;
mod watch;
pub use monitoring::*;
pub use watch::*;


use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

const ENV_PREFIX: &str = "REVWATCH";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    /// Watch engine tuning
    #[serde(default)]
    pub watch: WatchConfig,
    /// Metrics exposition
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Settings {
    /// Loads defaults, the `CONFIG_PATH` file and `REVWATCH__` environment
    /// variables without validating the result.
    ///
    /// Callers must call `validate()` once every override has been applied.
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(environment());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Layers `path` on top of the current values. Environment variables
    /// keep the highest priority.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn validate(self) -> Result<Self> {
        self.watch.validate()?;
        self.monitoring.validate()?;
        Ok(self)
    }

    /// `new()`, then the optional override file, then `validate()`
    pub fn load(override_path: Option<&str>) -> Result<Self> {
        let settings = Self::new()?;
        let settings = match override_path {
            Some(path) => settings.with_override_config(path)?,
            None => settings,
        };
        settings.validate()
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}
