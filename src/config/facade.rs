//! Config loader: assembles the layered sources and deserializes `DocforgeConfig`.

use super::merge::merge_policy;
use super::sources::{global_file, workspace_file};
use super::DocforgeConfig;
use config::{ConfigError, Environment, File};
use std::path::Path;

/// Environment overrides use `DOCFORGE__SECTION__KEY`, e.g. `DOCFORGE__PIPELINE__MAX_RETRIES=3`.
const ENV_PREFIX: &str = "DOCFORGE";
const ENV_SEPARATOR: &str = "__";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a workspace.
    ///
    /// Order (later wins): defaults, global file, `config/config.toml`,
    /// `config/{DOCFORGE_ENV}.toml`, environment.
    pub fn load(workspace_root: &Path) -> Result<DocforgeConfig, ConfigError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root)?;
        builder
            .add_source(environment())
            .build()?
            .try_deserialize()
    }

    /// Load configuration from an explicit file, still honoring environment overrides.
    pub fn load_from_file(path: &Path) -> Result<DocforgeConfig, ConfigError> {
        merge_policy::builder_with_defaults()?
            .add_source(File::from(path).required(true))
            .add_source(environment())
            .build()?
            .try_deserialize()
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}
