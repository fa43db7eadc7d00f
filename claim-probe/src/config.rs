//! Probe configuration.
//!
//! A [`ProbeConfig`] is built once at startup and passed by reference to
//! every component. It is never mutated after [`ProbeConfigBuilder::build`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ProbeError, ProbeResult};

/// Broker protocol version, e.g. `2.1.1`.
///
/// Versions before 1.0 carry four components (`0.10.2.1`), later versions
/// carry three (`2.1.1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KafkaVersion {
    parts: [u16; 4],
    len: usize,
}

impl KafkaVersion {
    /// Parses a version string.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::InvalidConfig`] if the string is not a valid
    /// broker version.
    pub fn parse(s: &str) -> ProbeResult<Self> {
        let invalid = || ProbeError::InvalidConfig(format!("invalid kafka version '{s}'"));

        let mut parts = [0u16; 4];
        let mut len = 0;
        for piece in s.split('.') {
            if len == parts.len() || piece.is_empty() {
                return Err(invalid());
            }
            if !piece.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            parts[len] = piece.parse().map_err(|_| invalid())?;
            len += 1;
        }

        let expected = if parts[0] == 0 { 4 } else { 3 };
        if len != expected {
            return Err(invalid());
        }

        Ok(Self { parts, len })
    }

    /// Returns the major version component.
    #[must_use]
    pub const fn major(&self) -> u16 {
        self.parts[0]
    }
}

impl Default for KafkaVersion {
    fn default() -> Self {
        Self {
            parts: [2, 1, 1, 0],
            len: 3,
        }
    }
}

impl fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts[..self.len].iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

impl FromStr for KafkaVersion {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Where a consumer starts when the group has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    /// Start from the oldest retained message.
    #[default]
    Oldest,
    /// Start from the next produced message.
    Newest,
}

impl OffsetReset {
    /// Returns the `auto.offset.reset` value for this policy.
    #[must_use]
    pub const fn as_kafka_value(self) -> &'static str {
        match self {
            Self::Oldest => "earliest",
            Self::Newest => "latest",
        }
    }
}

/// Immutable configuration for one probe run.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Bootstrap brokers.
    pub brokers: Vec<String>,
    /// Broker protocol version.
    pub version: KafkaVersion,
    /// Initial offset policy.
    pub offset_reset: OffsetReset,
    /// Forward client library logs.
    pub verbose: bool,
    /// Number of competing workers (N).
    pub workers: usize,
    /// Number of partitions on the probe topic (P).
    pub partitions: i32,
    /// Replication factor of the probe topic.
    pub replication_factor: i32,
    /// Deadline for the metadata round trip at startup.
    pub connect_timeout: Duration,
    /// Deadline for topic creation.
    pub topic_timeout: Duration,
    /// Deadline for every worker to signal readiness.
    pub ready_timeout: Duration,
    /// How long to keep waiting, once every worker is ready, for the claimed
    /// counts to add up to the partition count.
    pub settle_timeout: Duration,
    /// Deadline for worker tasks to exit after their sessions are closed.
    pub shutdown_timeout: Duration,
}

impl ProbeConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> ProbeConfigBuilder {
        ProbeConfigBuilder::new()
    }

    /// Returns the bootstrap servers as a comma-separated list.
    #[must_use]
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Returns how many workers must end up with zero partitions.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // partitions > 0 after validation.
    pub const fn expected_losers(&self) -> usize {
        self.workers.saturating_sub(self.partitions as usize)
    }

    /// Checks the configuration for values the probe cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> ProbeResult<()> {
        if self.brokers.is_empty() {
            return Err(ProbeError::InvalidConfig(
                "no bootstrap brokers defined, please set --brokers".to_string(),
            ));
        }
        if self.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err(ProbeError::InvalidConfig(
                "empty entry in broker list".to_string(),
            ));
        }
        if self.partitions <= 0 {
            return Err(ProbeError::InvalidConfig(format!(
                "partition count must be positive, got {}",
                self.partitions
            )));
        }
        if self.replication_factor <= 0 {
            return Err(ProbeError::InvalidConfig(format!(
                "replication factor must be positive, got {}",
                self.replication_factor
            )));
        }
        #[allow(clippy::cast_sign_loss)]
        let partitions = self.partitions as usize;
        if self.workers <= partitions {
            return Err(ProbeError::InvalidConfig(format!(
                "need more workers than partitions for a race, got {} workers for {partitions} partitions",
                self.workers
            )));
        }
        Ok(())
    }
}

/// Builder for [`ProbeConfig`].
#[derive(Debug)]
pub struct ProbeConfigBuilder {
    config: ProbeConfig,
}

impl Default for ProbeConfigBuilder {
    fn default() -> Self {
        Self {
            config: ProbeConfig {
                brokers: Vec::new(),
                version: KafkaVersion::default(),
                offset_reset: OffsetReset::default(),
                verbose: false,
                workers: 2,
                partitions: 1,
                replication_factor: 1,
                connect_timeout: Duration::from_secs(10),
                topic_timeout: Duration::from_secs(60),
                ready_timeout: Duration::from_secs(60),
                settle_timeout: Duration::from_secs(5),
                shutdown_timeout: Duration::from_secs(30),
            },
        }
    }
}

impl ProbeConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bootstrap brokers.
    #[must_use]
    pub fn brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.brokers = brokers.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the broker protocol version.
    #[must_use]
    pub const fn version(mut self, version: KafkaVersion) -> Self {
        self.config.version = version;
        self
    }

    /// Sets the initial offset policy.
    #[must_use]
    pub const fn offset_reset(mut self, offset_reset: OffsetReset) -> Self {
        self.config.offset_reset = offset_reset;
        self
    }

    /// Enables client library logging.
    #[must_use]
    pub const fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    /// Sets the number of competing workers.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Sets the partition count of the probe topic.
    #[must_use]
    pub const fn partitions(mut self, partitions: i32) -> Self {
        self.config.partitions = partitions;
        self
    }

    /// Sets the metadata round-trip deadline.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets the topic creation deadline.
    #[must_use]
    pub const fn topic_timeout(mut self, timeout: Duration) -> Self {
        self.config.topic_timeout = timeout;
        self
    }

    /// Sets the readiness rendezvous deadline.
    #[must_use]
    pub const fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.config.ready_timeout = timeout;
        self
    }

    /// Sets how long claims may take to settle after the rendezvous.
    #[must_use]
    pub const fn settle_timeout(mut self, timeout: Duration) -> Self {
        self.config.settle_timeout = timeout;
        self
    }

    /// Sets the worker shutdown deadline.
    #[must_use]
    pub const fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::InvalidConfig`] if validation fails.
    pub fn build(self) -> ProbeResult<ProbeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        assert_eq!(KafkaVersion::parse("2.1.1").unwrap().to_string(), "2.1.1");
        assert_eq!(
            KafkaVersion::parse("0.10.2.1").unwrap().to_string(),
            "0.10.2.1"
        );
        assert_eq!(KafkaVersion::parse("3.6.0").unwrap().major(), 3);
        assert_eq!(KafkaVersion::default().to_string(), "2.1.1");
    }

    #[test]
    fn test_version_parse_rejects_malformed() {
        for bad in ["", "2", "2.1", "2.1.1.1", "0.10.2", "2.x.1", "2..1", "v2.1.1", "2.1.-1"] {
            assert!(
                matches!(KafkaVersion::parse(bad), Err(ProbeError::InvalidConfig(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_offset_reset_values() {
        assert_eq!(OffsetReset::Oldest.as_kafka_value(), "earliest");
        assert_eq!(OffsetReset::Newest.as_kafka_value(), "latest");
    }

    #[test]
    fn test_builder_defaults() {
        let config = ProbeConfig::builder()
            .brokers(["localhost:9092"])
            .build()
            .unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(config.partitions, 1);
        assert_eq!(config.replication_factor, 1);
        assert_eq!(config.expected_losers(), 1);
        assert_eq!(config.offset_reset, OffsetReset::Oldest);
        assert_eq!(config.bootstrap_servers(), "localhost:9092");
    }

    #[test]
    fn test_builder_rejects_missing_brokers() {
        let err = ProbeConfig::builder().build().unwrap_err();
        assert!(err.to_string().contains("--brokers"));

        let err = ProbeConfig::builder()
            .brokers(["a:9092", " "])
            .build()
            .unwrap_err();
        assert!(matches!(err, ProbeError::InvalidConfig(_)));
    }

    #[test]
    fn test_builder_rejects_no_race() {
        let err = ProbeConfig::builder()
            .brokers(["a:9092"])
            .workers(2)
            .partitions(2)
            .build()
            .unwrap_err();
        assert!(matches!(err, ProbeError::InvalidConfig(_)));

        let err = ProbeConfig::builder()
            .brokers(["a:9092"])
            .partitions(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ProbeError::InvalidConfig(_)));
    }

    #[test]
    fn test_bootstrap_servers_joins() {
        let config = ProbeConfig::builder()
            .brokers(["a:9092", "b:9092"])
            .workers(3)
            .build()
            .unwrap();
        assert_eq!(config.bootstrap_servers(), "a:9092,b:9092");
        assert_eq!(config.expected_losers(), 2);
    }
}
