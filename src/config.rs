//! Engine configuration, passed explicitly to each connection driver.

use crate::error::ConfigError;
use crate::s11n::{Role, MAX_CONTENT_LEN};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use std::path::Path;

/// Default number of buffered output bytes that triggers sending a record.
pub const DEFAULT_OUTPUT_THRESHOLD: usize = 8192;

/// Default capacity of the output record channel used by the async service.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Prefix for environment variable overrides, e.g. `FCGI_ENGINE_BODY_MODE=streaming`.
pub const ENV_PREFIX: &str = "FCGI_ENGINE_";

/// When the request callback gets to see the body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyMode {
    /// Collect the whole STDIN stream, then call the handler.
    #[default]
    Buffered,
    /// Call the handler as soon as the params are in and read STDIN on demand.
    Streaming,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub body_mode: BodyMode,

    /// Buffered STDOUT/STDERR bytes that cause a record to be sent before the request ends.
    #[serde(default = "default_output_threshold")]
    pub output_threshold: usize,

    /// Pad outgoing records to a multiple of 8 bytes.
    #[serde(default)]
    pub pad_records: bool,

    /// Roles this worker serves; anything else is answered with UNKNOWN_ROLE.
    #[serde(default = "default_accepted_roles")]
    pub accepted_roles: Vec<Role>,

    /// Reported as FCGI_MAX_CONNS in GET_VALUES_RESULT.
    #[serde(default = "default_max_conns")]
    pub max_conns: u32,

    /// Reported as FCGI_MAX_REQS in GET_VALUES_RESULT.
    #[serde(default = "default_max_reqs")]
    pub max_reqs: u32,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Application status reported when the handler fails or panics.
    #[serde(default = "default_error_status")]
    pub error_status: i32,
}

const fn default_output_threshold() -> usize {
    DEFAULT_OUTPUT_THRESHOLD
}

fn default_accepted_roles() -> Vec<Role> {
    vec![Role::Responder]
}

const fn default_max_conns() -> u32 {
    1
}

const fn default_max_reqs() -> u32 {
    1
}

const fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

const fn default_error_status() -> i32 {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            body_mode: BodyMode::default(),
            output_threshold: default_output_threshold(),
            pad_records: false,
            accepted_roles: default_accepted_roles(),
            max_conns: default_max_conns(),
            max_reqs: default_max_reqs(),
            channel_capacity: default_channel_capacity(),
            error_status: default_error_status(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from defaults, then the TOML file at `path` (if given), then
    /// `FCGI_ENGINE_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::Invalid(format!(
                    "configuration file not found: {}", path.display())));
            }
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: EngineConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_threshold == 0 || self.output_threshold > MAX_CONTENT_LEN {
            return Err(ConfigError::Invalid(format!(
                "output_threshold must be between 1 and {}, got {}",
                MAX_CONTENT_LEN, self.output_threshold)));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel_capacity must be at least 1".to_owned()));
        }
        if self.accepted_roles.is_empty() {
            return Err(ConfigError::Invalid("accepted_roles must not be empty".to_owned()));
        }
        Ok(())
    }

    pub fn accepts(&self, role: Role) -> bool {
        self.accepted_roles.contains(&role)
    }
}
