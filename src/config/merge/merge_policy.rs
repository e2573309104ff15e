//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
///
/// Only keys that later layers commonly override partially are seeded here; the
/// remaining defaults come from the serde `default` attributes on the config types.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("pipeline.batch_size_analysis", 10)?
        .set_default("pipeline.batch_size_chapters", 8)?
        .set_default("pipeline.max_retries", 2)?
        .set_default("pipeline.auto_fix", true)
}
