//! Claim Probe: exclusive partition claim verification
//!
//! Checks a Kafka-compatible broker's consumer-group protocol by racing
//! several consumers for a small topic and verifying that every partition
//! ends up with exactly one of them.
//!
//! # Architecture
//!
//! The race runs over a narrow broker facade ([`GroupBroker`],
//! [`GroupSession`], [`GroupHandler`]) with two implementations:
//! - **Kafka mode**: [`KafkaBroker`] on top of librdkafka
//! - **Memory mode**: [`MemoryBroker`], an in-process coordinator with fault
//!   injection
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use claim_probe::{MemoryBroker, Orchestrator, ProbeConfig};
//!
//! let config = ProbeConfig::builder()
//!     .brokers(["localhost:9092"])
//!     .workers(2)
//!     .partitions(1)
//!     .build()?;
//!
//! let report = Orchestrator::new(config, Arc::new(MemoryBroker::new()))
//!     .run()
//!     .await?;
//!
//! assert_eq!(report.winners.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod error;
mod evaluator;
mod naming;
mod orchestrator;
mod session;
mod worker;

pub mod config;
pub mod kafka;
pub mod memory;

pub use config::{KafkaVersion, OffsetReset, ProbeConfig, ProbeConfigBuilder};
pub use error::{ProbeError, ProbeResult};
pub use evaluator::{evaluate_claims, ClaimVerdict, ClaimViolation};
pub use kafka::KafkaBroker;
pub use memory::{Assignor, MemoryBroker};
pub use naming::{group_name, topic_name};
pub use orchestrator::{Orchestrator, RaceReport};
pub use session::{
    BrokerInfo, Claim, ClaimStream, ClusterInfo, ConsumeOutcome, Delivery, GroupBroker,
    GroupHandler, GroupSession, MessageMarker, TopicCreation, TopicSpec, CLAIM_BUFFER,
};
pub use worker::{Worker, WorkerId, READY_BUFFER_PER_WORKER};
