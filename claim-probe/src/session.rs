//! Broker client contract consumed by the probe.
//!
//! The probe never talks to a broker directly. It goes through a
//! [`GroupBroker`], which hands out one [`GroupSession`] per worker. A session
//! drives the consumer-group protocol and calls back into a [`GroupHandler`]
//! on every rebalance:
//!
//! 1. [`GroupHandler::setup`] with the partitions claimed for the new session
//! 2. [`GroupHandler::consume_claim`] once per claimed partition, fed by a
//!    [`ClaimStream`]
//! 3. [`GroupHandler::cleanup`] when the session ends
//!
//! Two implementations exist: [`KafkaBroker`](crate::KafkaBroker) over
//! librdkafka and [`MemoryBroker`](crate::MemoryBroker) in process.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;

use crate::error::{ProbeError, ProbeResult};

/// Deliveries buffered per claim before the session waits on the handler.
pub const CLAIM_BUFFER: usize = 256;

/// A topic to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    /// Topic name.
    pub name: String,
    /// Number of partitions.
    pub partitions: i32,
    /// Replication factor.
    pub replication_factor: i32,
}

impl TopicSpec {
    /// Creates a new topic specification.
    #[must_use]
    pub fn new(name: impl Into<String>, partitions: i32, replication_factor: i32) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }
}

/// Successful outcome of a topic creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicCreation {
    /// The broker created the topic.
    Created,
    /// The topic was already present.
    AlreadyExists,
}

/// A broker as reported by cluster metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerInfo {
    /// Broker id.
    pub id: i32,
    /// Advertised host.
    pub host: String,
    /// Advertised port.
    pub port: i32,
}

impl fmt::Display for BrokerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

/// Cluster view obtained when connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    /// Brokers in the cluster.
    pub brokers: Vec<BrokerInfo>,
    /// Broker that answered the metadata request.
    pub origin_broker: i32,
}

/// One partition claimed by a group member for the duration of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Claim {
    /// Topic name.
    pub topic: String,
    /// Partition.
    pub partition: i32,
}

impl Claim {
    /// Creates a new claim.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// A message delivered on a claimed partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Topic name.
    pub topic: String,
    /// Partition.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Message key.
    pub key: Option<Bytes>,
    /// Message value.
    pub value: Option<Bytes>,
    /// Broker or producer timestamp in milliseconds.
    pub timestamp_ms: Option<i64>,
}

/// How a [`GroupSession::consume`] call ended without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The session ended (for example on a rebalance); call `consume` again.
    SessionEnded,
    /// The session handle was closed; the consume loop must stop.
    GroupClosed,
}

/// Marks delivered messages as consumed.
pub trait MessageMarker: Send + Sync {
    /// Marks `delivery` as consumed with empty commit metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the offset cannot be stored.
    fn mark_message(&self, delivery: &Delivery) -> ProbeResult<()>;
}

/// Ordered stream of deliveries for a single claim.
///
/// Ends when the owning session ends.
#[derive(Debug)]
pub struct ClaimStream {
    claim: Claim,
    rx: mpsc::Receiver<Delivery>,
}

impl ClaimStream {
    /// Creates a stream and the sender that feeds it.
    #[must_use]
    pub fn channel(claim: Claim) -> (mpsc::Sender<Delivery>, Self) {
        let (tx, rx) = mpsc::channel(CLAIM_BUFFER);
        (tx, Self { claim, rx })
    }

    /// Returns the claim this stream delivers for.
    #[must_use]
    pub const fn claim(&self) -> &Claim {
        &self.claim
    }

    /// Waits for the next delivery. Returns `None` once the session ended.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// Callbacks invoked by a session on every rebalance.
#[async_trait]
pub trait GroupHandler: Send + Sync {
    /// Runs at the start of a session, before any delivery.
    ///
    /// # Errors
    ///
    /// An error ends the consume call with that error.
    fn setup(&self, claims: &[Claim]) -> ProbeResult<()>;

    /// Runs at the end of a session, after every `consume_claim` returned.
    ///
    /// # Errors
    ///
    /// An error ends the consume call with that error.
    fn cleanup(&self, claims: &[Claim]) -> ProbeResult<()>;

    /// Processes the deliveries of one claim until the stream ends.
    ///
    /// # Errors
    ///
    /// An error ends the consume call with that error.
    async fn consume_claim(
        &self,
        marker: &dyn MessageMarker,
        claim: &mut ClaimStream,
    ) -> ProbeResult<()>;
}

/// A member's handle on a consumer group.
#[async_trait]
pub trait GroupSession: Send + Sync {
    /// Returns the member identifier used when joining.
    fn member(&self) -> &str;

    /// Joins the group for `topics` and runs one session.
    ///
    /// # Errors
    ///
    /// Returns an error on any broker or handler failure.
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn GroupHandler>,
    ) -> ProbeResult<ConsumeOutcome>;

    /// Closes the handle and leaves the group.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::SessionAlreadyClosed`] on every call after the
    /// first.
    async fn close(&self) -> ProbeResult<()>;

    /// Returns true once [`close`](Self::close) has been called.
    fn is_closed(&self) -> bool;
}

/// Entry point to a broker cluster.
#[async_trait]
pub trait GroupBroker: Send + Sync {
    /// Checks connectivity and returns the cluster view.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Connect`] if the cluster is unreachable.
    async fn connect(&self) -> ProbeResult<ClusterInfo>;

    /// Creates a topic, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::TopicCreation`] for every rejection other than
    /// "already exists".
    async fn create_topic(&self, spec: &TopicSpec, timeout: Duration)
        -> ProbeResult<TopicCreation>;

    /// Returns a new session handle for `member` in `group`.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created.
    async fn join_group(&self, group: &str, member: &str) -> ProbeResult<Arc<dyn GroupSession>>;
}

/// Close flag shared between a session handle and its consume loop.
#[derive(Debug)]
pub(crate) struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Sets the flag. Returns false if it was already set.
    pub(crate) fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is set.
    pub(crate) async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Folds a claim task's join result into a probe result.
pub(crate) fn join_result(joined: Result<ProbeResult<()>, JoinError>) -> ProbeResult<()> {
    joined.map_err(|e| ProbeError::WorkerAborted(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_signal_only_closes_once() {
        let signal = CloseSignal::new();
        assert!(!signal.is_closed());
        assert!(signal.close());
        assert!(signal.is_closed());
        assert!(!signal.close());
    }

    #[tokio::test]
    async fn test_close_signal_wakes_waiter() {
        let signal = Arc::new(CloseSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.closed().await })
        };
        tokio::task::yield_now().await;
        signal.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn test_claim_stream_ends_with_sender() {
        let (tx, mut stream) = ClaimStream::channel(Claim::new("t", 0));
        assert_eq!(stream.claim().to_string(), "t:0");

        tx.send(Delivery {
            topic: "t".to_string(),
            partition: 0,
            offset: 7,
            key: None,
            value: Some(Bytes::from_static(b"v")),
            timestamp_ms: None,
        })
        .await
        .unwrap();
        drop(tx);

        assert_eq!(stream.next().await.map(|d| d.offset), Some(7));
        assert!(stream.next().await.is_none());
    }
}
