//! Configuration for workflow-daemon

use serde::{Deserialize, Serialize};
use workflow_engine::{EngineConfig, ExecutionConfig, MessagingConfig, StorageConfig};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Topics and routing keys
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Object storage coordinates
    #[serde(default)]
    pub storage: StorageConfig,

    /// Execution behaviour
    #[serde(default)]
    pub engine: ExecutionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `WORKFLOW__<SECTION>__<KEY>` environment variables
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("WORKFLOW")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// The part of the configuration the engine consumes
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            messaging: self.messaging.clone(),
            storage: self.storage.clone(),
            engine: self.engine.clone(),
        }
    }
}
