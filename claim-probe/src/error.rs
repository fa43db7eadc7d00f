//! Error types for the claim probe.
//!
//! Every failure class of a run maps to one variant. Outcomes the probe
//! tolerates ("topic already exists", "group closed") are not errors at all;
//! they are variants of [`TopicCreation`](crate::TopicCreation) and
//! [`ConsumeOutcome`](crate::ConsumeOutcome).

use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::evaluator::ClaimViolation;
use crate::worker::WorkerId;

/// Result type for probe operations.
pub type ProbeResult<T> = Result<T, ProbeError>;

/// Errors that can occur during a probe run.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kafka client error.
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// The cluster could not be reached or returned no brokers.
    #[error("cannot connect to cluster: {message}")]
    Connect {
        /// Description of the failure.
        message: String,
    },

    /// The broker rejected topic creation for a reason other than
    /// "already exists".
    #[error("create topic {topic}: {reason}")]
    TopicCreation {
        /// Topic name.
        topic: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// A consume call failed with something other than a closed group.
    #[error("consume failed for member {member}: {message}")]
    Consume {
        /// Group member whose session failed.
        member: String,
        /// Description of the failure.
        message: String,
    },

    /// The topic is not known to the broker.
    #[error("unknown topic: {topic}")]
    UnknownTopic {
        /// Topic name.
        topic: String,
    },

    /// A group handler callback failed.
    #[error("handler failed for worker {worker}: {message}")]
    Handler {
        /// Worker whose callback failed.
        worker: WorkerId,
        /// Description of the failure.
        message: String,
    },

    /// A session handle was closed a second time.
    #[error("session for member {member} is already closed")]
    SessionAlreadyClosed {
        /// Group member identifier.
        member: String,
    },

    /// Not every worker signaled readiness before the deadline.
    #[error("timeout after {waited:?}: {ready} of {expected} workers ready")]
    ReadyTimeout {
        /// How long the orchestrator waited.
        waited: Duration,
        /// Workers that signaled readiness.
        ready: usize,
        /// Workers expected.
        expected: usize,
    },

    /// The observed claims violate the exclusive-assignment invariant.
    #[error("claim invariant violated: {0}")]
    Invariant(#[from] ClaimViolation),

    /// A worker task panicked or was cancelled unexpectedly.
    #[error("worker task aborted: {0}")]
    WorkerAborted(String),
}

impl ProbeError {
    /// Returns the process exit code for this error class.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfig(_) => 2,
            Self::Kafka(_) | Self::Connect { .. } => 3,
            Self::TopicCreation { .. } | Self::UnknownTopic { .. } => 4,
            Self::Consume { .. } | Self::Handler { .. } | Self::WorkerAborted(_) => 5,
            Self::SessionAlreadyClosed { .. } => 6,
            Self::ReadyTimeout { .. } => 7,
            Self::Invariant(_) => 8,
        }
    }

    /// Returns true if the error came from the exclusive-claim check rather
    /// than from infrastructure.
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}
