use crate::error::{Error, Result};

use serde::Deserialize;
use std::time::Duration;

/// Raft core configuration. Loaded from an optional config file, overridden
/// by RAFTCORE_* environment variables, e.g. RAFTCORE_ELECTION_TIMEOUT_MS.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RaftConfig {
    /// The base election timeout. Followers start an election after a random
    /// delay in [T, 2T] without hearing from a leader.
    pub election_timeout_ms: u64,
    /// The leader heartbeat interval. Defaults to a third of the election
    /// timeout.
    #[serde(default)]
    pub heartbeat_interval_ms: Option<u64>,
    /// Whether to hold a pre-election before bumping the term.
    pub enable_pre_voting: bool,
    /// Never start elections. Such a member still votes and replicates.
    pub refuse_to_be_leader: bool,
    /// The number of entries per catchup batch.
    pub catchup_batch_size: usize,
    /// How far behind a pipelined follower may fall before it is moved to
    /// catchup mode.
    pub max_allowed_shipping_lag: u64,
    /// How long a log shipper waits for a response before resending.
    pub log_shipping_retry_ms: u64,
    /// Whether to cache recently appended entries for log shipping.
    pub in_flight_cache_enabled: bool,
    pub in_flight_cache_max_entries: usize,
    pub in_flight_cache_max_bytes: usize,
    /// The log level, as parsed by simplelog.
    pub log_level: String,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: 500,
            heartbeat_interval_ms: None,
            enable_pre_voting: true,
            refuse_to_be_leader: false,
            catchup_batch_size: 64,
            max_allowed_shipping_lag: 256,
            log_shipping_retry_ms: 1000,
            in_flight_cache_enabled: true,
            in_flight_cache_max_entries: 1024,
            in_flight_cache_max_bytes: 8 * 1024 * 1024,
            log_level: "info".to_string(),
        }
    }
}

impl RaftConfig {
    /// Loads the configuration from the given file, if any, and the
    /// environment. Unset keys take their default values.
    pub fn load(file: Option<&str>) -> Result<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder()
            .set_default("election_timeout_ms", defaults.election_timeout_ms as i64)?
            .set_default("enable_pre_voting", defaults.enable_pre_voting)?
            .set_default("refuse_to_be_leader", defaults.refuse_to_be_leader)?
            .set_default("catchup_batch_size", defaults.catchup_batch_size as i64)?
            .set_default("max_allowed_shipping_lag", defaults.max_allowed_shipping_lag as i64)?
            .set_default("log_shipping_retry_ms", defaults.log_shipping_retry_ms as i64)?
            .set_default("in_flight_cache_enabled", defaults.in_flight_cache_enabled)?
            .set_default("in_flight_cache_max_entries", defaults.in_flight_cache_max_entries as i64)?
            .set_default("in_flight_cache_max_bytes", defaults.in_flight_cache_max_bytes as i64)?
            .set_default("log_level", defaults.log_level)?;
        if let Some(file) = file {
            builder = builder.add_source(config::File::with_name(file));
        }
        let config: Self = builder
            .add_source(config::Environment::with_prefix("RAFTCORE").try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_ms == 0 {
            return Err(Error::Config("election timeout must be positive".into()));
        }
        if self.election_timeout() < self.heartbeat_interval() {
            return Err(Error::Config(format!(
                "election timeout {}ms is shorter than heartbeat interval {}ms",
                self.election_timeout_ms,
                self.heartbeat_interval().as_millis()
            )));
        }
        if self.catchup_batch_size == 0 {
            return Err(Error::Config("catchup batch size must be positive".into()));
        }
        if self.in_flight_cache_enabled
            && (self.in_flight_cache_max_entries == 0 || self.in_flight_cache_max_bytes == 0)
        {
            return Err(Error::Config("in-flight cache limits must be positive".into()));
        }
        Ok(())
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.unwrap_or(self.election_timeout_ms / 3))
    }

    pub fn log_shipping_retry(&self) -> Duration {
        Duration::from_millis(self.log_shipping_retry_ms)
    }
}
