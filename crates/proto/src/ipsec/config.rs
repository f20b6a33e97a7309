//! ESP transform and crypto engine configuration
//!
//! Provides configuration structures and builder patterns for
//! [`EspXform`](super::esp::EspXform) and
//! [`SoftwareEngine`](super::crypto::SoftwareEngine).

use super::{
    replay::{DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE, MIN_WINDOW_SIZE},
    Error, Result,
};
use tokio::sync::Semaphore;

/// Default bound on in-flight crypto jobs
pub const DEFAULT_MAX_INFLIGHT: usize = 1024;

/// ESP transform configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EspConfig {
    /// Global ESP switch; when off every packet is dropped
    pub enabled: bool,

    /// Replay window for SAs that do not pick their own
    pub default_replay_window: u32,
}

impl Default for EspConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_replay_window: DEFAULT_WINDOW_SIZE,
        }
    }
}

impl EspConfig {
    /// Create builder for ESP configuration
    pub fn builder() -> EspConfigBuilder {
        EspConfigBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&self.default_replay_window) {
            return Err(Error::Config(format!(
                "default replay window must be between {} and {}",
                MIN_WINDOW_SIZE, MAX_WINDOW_SIZE
            )));
        }
        Ok(())
    }
}

/// Builder for EspConfig
#[derive(Default)]
pub struct EspConfigBuilder {
    enabled: Option<bool>,
    default_replay_window: Option<u32>,
}

impl EspConfigBuilder {
    /// Create new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable ESP processing
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Set the default replay window size
    pub fn with_default_replay_window(mut self, size: u32) -> Self {
        self.default_replay_window = Some(size);
        self
    }

    /// Build EspConfig with validation
    pub fn build(self) -> Result<EspConfig> {
        let config = EspConfig {
            enabled: self.enabled.unwrap_or(true),
            default_replay_window: self.default_replay_window.unwrap_or(DEFAULT_WINDOW_SIZE),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Software crypto engine configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Jobs that may be in flight at once
    pub max_inflight: usize,

    /// Advertise detached associated data
    pub separate_aad: bool,

    /// Advertise ESN-extended HMAC input
    pub esn: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_inflight: DEFAULT_MAX_INFLIGHT,
            separate_aad: true,
            esn: true,
        }
    }
}

impl EngineConfig {
    /// Create builder for engine configuration
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_inflight == 0 {
            return Err(Error::Config("max_inflight cannot be zero".into()));
        }
        if self.max_inflight > Semaphore::MAX_PERMITS {
            return Err(Error::Config(format!(
                "max_inflight cannot exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

/// Builder for EngineConfig
#[derive(Default)]
pub struct EngineConfigBuilder {
    max_inflight: Option<usize>,
    separate_aad: Option<bool>,
    esn: Option<bool>,
}

impl EngineConfigBuilder {
    /// Create new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the in-flight job bound
    pub fn with_max_inflight(mut self, max: usize) -> Self {
        self.max_inflight = Some(max);
        self
    }

    /// Set detached associated data support
    pub fn with_separate_aad(mut self, enabled: bool) -> Self {
        self.separate_aad = Some(enabled);
        self
    }

    /// Set ESN support
    pub fn with_esn(mut self, enabled: bool) -> Self {
        self.esn = Some(enabled);
        self
    }

    /// Build EngineConfig with validation
    pub fn build(self) -> Result<EngineConfig> {
        let defaults = EngineConfig::default();
        let config = EngineConfig {
            max_inflight: self.max_inflight.unwrap_or(defaults.max_inflight),
            separate_aad: self.separate_aad.unwrap_or(defaults.separate_aad),
            esn: self.esn.unwrap_or(defaults.esn),
        };
        config.validate()?;
        Ok(config)
    }
}
