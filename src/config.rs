//! Raft client runtime configuration.

use thiserror::Error;

/// Error variants related to configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The admission limit must admit at least one request.
    #[error("max_outstanding_requests must be greater than 0")]
    MaxOutstandingTooSmall,
}

/// The runtime configuration for a Raft client.
///
/// When building the configuration, an `Err` will be returned if the
/// validation constraints of any of the configured values are violated.
#[derive(Clone, Debug)]
pub struct Config {
    /// The ID of the Raft group this client addresses.
    ///
    /// It is carried on every request so servers can reject requests routed
    /// to the wrong group.
    pub group_id: String,

    /// The maximum number of requests which may be outstanding across all of
    /// the client's windows at any point in time.
    ///
    /// A request counts against this limit from the moment it is admitted
    /// until its reply (or terminal failure) has been handed to the caller.
    pub max_outstanding_requests: usize,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(group_id: String) -> ConfigBuilder {
        ConfigBuilder {
            group_id,
            max_outstanding_requests: None,
        }
    }
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    group_id: String,
    max_outstanding_requests: Option<usize>,
}

impl ConfigBuilder {
    /// Set the value for `max_outstanding_requests`.
    pub fn max_outstanding_requests(mut self, val: usize) -> Self {
        self.max_outstanding_requests = Some(val);
        self
    }

    /// Validate the state of this builder, returning a Config on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let max_outstanding_requests = self.max_outstanding_requests.unwrap_or(DEFAULT_MAX_OUTSTANDING_REQUESTS);
        if max_outstanding_requests == 0 {
            return Err(ConfigError::MaxOutstandingTooSmall);
        }
        Ok(Config {
            group_id: self.group_id,
            max_outstanding_requests,
        })
    }
}

/// Default admission limit, a small multiple of a typical server-side window.
const DEFAULT_MAX_OUTSTANDING_REQUESTS: usize = 100;
