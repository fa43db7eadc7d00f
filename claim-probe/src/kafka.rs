//! librdkafka-backed broker client.
//!
//! Rebalance callbacks arrive through [`ConsumerContext::post_rebalance`],
//! which librdkafka invokes from inside `recv()`. They are recorded in the
//! member's context and applied by the consuming task, which wakes on every
//! recorded event even when no message arrives. Marks are offset stores
//! picked up by the next auto-commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::BorrowedMessage;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientContext, Message};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ProbeConfig;
use crate::error::{ProbeError, ProbeResult};
use crate::session::{
    join_result, BrokerInfo, Claim, ClaimStream, CloseSignal, ClusterInfo, ConsumeOutcome,
    Delivery, GroupBroker, GroupHandler, GroupSession, MessageMarker, TopicCreation, TopicSpec,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds the client configuration shared by the admin client and every
/// group member.
#[must_use]
pub fn client_config(config: &ProbeConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("api.version.request", "true")
        .set("broker.version.fallback", config.version.to_string());

    if config.verbose {
        client
            .set("debug", "consumer,cgrp,topic")
            .set_log_level(RDKafkaLogLevel::Debug);
    }
    client
}

/// Forwards librdkafka logs into `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingContext;

impl ClientContext for TracingContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        forward_log(level, fac, log_message);
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(target: "rdkafka", error = %error, reason, "client error");
    }
}

fn forward_log(level: RDKafkaLogLevel, fac: &str, log_message: &str) {
    match level {
        RDKafkaLogLevel::Emerg
        | RDKafkaLogLevel::Alert
        | RDKafkaLogLevel::Critical
        | RDKafkaLogLevel::Error => error!(target: "rdkafka", facility = fac, "{log_message}"),
        RDKafkaLogLevel::Warning => warn!(target: "rdkafka", facility = fac, "{log_message}"),
        RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
            info!(target: "rdkafka", facility = fac, "{log_message}");
        }
        RDKafkaLogLevel::Debug => debug!(target: "rdkafka", facility = fac, "{log_message}"),
    }
}

/// Broker client over librdkafka.
pub struct KafkaBroker {
    config: ProbeConfig,
    admin: AdminClient<TracingContext>,
}

impl KafkaBroker {
    /// Creates the admin client for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if librdkafka rejects the configuration.
    pub fn new(config: &ProbeConfig) -> ProbeResult<Self> {
        let admin = client_config(config).create_with_context(TracingContext)?;
        Ok(Self {
            config: config.clone(),
            admin,
        })
    }
}

#[async_trait]
impl GroupBroker for KafkaBroker {
    async fn connect(&self) -> ProbeResult<ClusterInfo> {
        let metadata = self
            .admin
            .inner()
            .fetch_metadata(None, self.config.connect_timeout)
            .map_err(|e| ProbeError::Connect {
                message: e.to_string(),
            })?;

        let brokers: Vec<BrokerInfo> = metadata
            .brokers()
            .iter()
            .map(|b| BrokerInfo {
                id: b.id(),
                host: b.host().to_string(),
                port: b.port(),
            })
            .collect();

        if brokers.is_empty() {
            return Err(ProbeError::Connect {
                message: format!("no brokers reachable at {}", self.config.bootstrap_servers()),
            });
        }

        Ok(ClusterInfo {
            brokers,
            origin_broker: metadata.orig_broker_id(),
        })
    }

    async fn create_topic(
        &self,
        spec: &TopicSpec,
        timeout: Duration,
    ) -> ProbeResult<TopicCreation> {
        let topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor),
        );
        let options = AdminOptions::new()
            .operation_timeout(Some(timeout))
            .request_timeout(Some(timeout));

        let results = self.admin.create_topics([&topic], &options).await?;

        let mut creation = TopicCreation::Created;
        for result in results {
            match result {
                Ok(_) => {}
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    creation = TopicCreation::AlreadyExists;
                }
                Err((name, code)) => {
                    return Err(ProbeError::TopicCreation {
                        topic: name,
                        reason: code.to_string(),
                    });
                }
            }
        }
        Ok(creation)
    }

    async fn join_group(&self, group: &str, member: &str) -> ProbeResult<Arc<dyn GroupSession>> {
        let session = KafkaSession::new(&self.config, group, member)?;
        Ok(Arc::new(session))
    }
}

/// Consumer context of one group member.
///
/// Rebalance callbacks only record what happened and wake the consuming task.
/// Setup and cleanup run on that task at session boundaries, so a session's
/// claims are drained before its cleanup.
struct MemberContext {
    member: String,
    assigned: Mutex<Option<Vec<Claim>>>,
    revoked: AtomicBool,
    failure: Mutex<Option<ProbeError>>,
    wake: Notify,
}

impl MemberContext {
    fn new(member: &str) -> Self {
        Self {
            member: member.to_string(),
            assigned: Mutex::new(None),
            revoked: AtomicBool::new(false),
            failure: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    fn assign(&self, claims: Vec<Claim>) {
        debug!(member = %self.member, claims = claims.len(), "partitions assigned");
        *lock(&self.assigned) = Some(claims);
        self.wake.notify_one();
    }

    fn revoke(&self) {
        debug!(member = %self.member, "partitions revoked");
        self.revoked.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    fn fail(&self, err: ProbeError) {
        {
            let mut failure = lock(&self.failure);
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        self.wake.notify_one();
    }

    fn take_failure(&self) -> Option<ProbeError> {
        lock(&self.failure).take()
    }

    fn take_revoke(&self) -> bool {
        self.revoked.swap(false, Ordering::AcqRel)
    }

    fn take_assignment(&self) -> Option<Vec<Claim>> {
        lock(&self.assigned).take()
    }

    fn has_pending_assignment(&self) -> bool {
        lock(&self.assigned).is_some()
    }
}

impl ClientContext for MemberContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        forward_log(level, fac, log_message);
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(target: "rdkafka", member = %self.member, error = %error, reason, "client error");
    }
}

impl ConsumerContext for MemberContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => self.assign(
                tpl.elements()
                    .iter()
                    .map(|e| Claim::new(e.topic(), e.partition()))
                    .collect(),
            ),
            Rebalance::Revoke(_) => self.revoke(),
            Rebalance::Error(message) => self.fail(ProbeError::Consume {
                member: self.member.clone(),
                message: format!("rebalance failed: {message}"),
            }),
        }
    }
}

/// Applies pending rebalance events to the running session.
///
/// Returns true when the active session must end. A pending assignment is
/// only set up once no session is active.
fn advance(
    context: &MemberContext,
    handler: &dyn GroupHandler,
    active: &mut Option<Vec<Claim>>,
) -> ProbeResult<bool> {
    if let Some(err) = context.take_failure() {
        return Err(err);
    }
    if context.take_revoke() && active.is_some() {
        return Ok(true);
    }
    if active.is_some() {
        return Ok(context.has_pending_assignment());
    }
    if let Some(claims) = context.take_assignment() {
        handler.setup(&claims)?;
        *active = Some(claims);
    }
    Ok(false)
}

type MemberConsumer = StreamConsumer<MemberContext>;

/// Stores offsets through the member's consumer.
struct OffsetMarker {
    consumer: Arc<MemberConsumer>,
}

impl OffsetMarker {
    fn owns(&self, delivery: &Delivery) -> bool {
        self.consumer.assignment().is_ok_and(|tpl| {
            tpl.find_partition(&delivery.topic, delivery.partition)
                .is_some()
        })
    }
}

impl MessageMarker for OffsetMarker {
    fn mark_message(&self, delivery: &Delivery) -> ProbeResult<()> {
        // The stored offset is the next one to read.
        match self
            .consumer
            .store_offset(&delivery.topic, delivery.partition, delivery.offset + 1)
        {
            Ok(()) => Ok(()),
            // Deliveries still buffered when the partition was revoked.
            Err(e) if !self.owns(delivery) => {
                debug!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %e,
                    "partition revoked, offset not stored"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn to_delivery(message: &BorrowedMessage<'_>) -> Delivery {
    Delivery {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        value: message.payload().map(Bytes::copy_from_slice),
        timestamp_ms: message.timestamp().to_millis(),
    }
}

/// Hands `delivery` to the claim task of its partition, starting one if needed.
async fn feed_claim(
    delivery: Delivery,
    handler: &Arc<dyn GroupHandler>,
    marker: &Arc<dyn MessageMarker>,
    feeds: &mut HashMap<Claim, mpsc::Sender<Delivery>>,
    tasks: &mut JoinSet<ProbeResult<()>>,
) {
    let claim = Claim::new(delivery.topic.clone(), delivery.partition);
    let feed = feeds.entry(claim.clone()).or_insert_with(|| {
        let (tx, mut stream) = ClaimStream::channel(claim);
        let handler = Arc::clone(handler);
        let marker = Arc::clone(marker);
        tasks.spawn(async move { handler.consume_claim(marker.as_ref(), &mut stream).await });
        tx
    });
    // A closed feed means the claim task failed; join_next reports it.
    let _ = feed.send(delivery).await;
}

/// A group member backed by a librdkafka consumer.
///
/// Each `consume` call covers one session: from a setup on assignment to the
/// next revoke. The consumer is dropped, and with it the member leaves the
/// group, once both the handle has been closed and the running consume call
/// returned.
pub struct KafkaSession {
    member: String,
    consumer: Mutex<Option<Arc<MemberConsumer>>>,
    subscribed: AtomicBool,
    /// Delivery received after the session it belongs to started ending.
    carry: Mutex<Option<Delivery>>,
    close: CloseSignal,
}

impl KafkaSession {
    fn new(config: &ProbeConfig, group: &str, member: &str) -> ProbeResult<Self> {
        let consumer: MemberConsumer = client_config(config)
            .set("group.id", group)
            .set("client.id", member)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", config.offset_reset.as_kafka_value())
            .create_with_context(MemberContext::new(member))?;

        Ok(Self {
            member: member.to_string(),
            consumer: Mutex::new(Some(Arc::new(consumer))),
            subscribed: AtomicBool::new(false),
            carry: Mutex::new(None),
            close: CloseSignal::new(),
        })
    }

    fn consumer(&self) -> Option<Arc<MemberConsumer>> {
        lock(&self.consumer).clone()
    }

    fn consume_error(&self, message: impl Into<String>) -> ProbeError {
        ProbeError::Consume {
            member: self.member.clone(),
            message: message.into(),
        }
    }

    async fn pump(
        &self,
        consumer: &Arc<MemberConsumer>,
        handler: &Arc<dyn GroupHandler>,
        active: &mut Option<Vec<Claim>>,
        feeds: &mut HashMap<Claim, mpsc::Sender<Delivery>>,
        tasks: &mut JoinSet<ProbeResult<()>>,
    ) -> ProbeResult<ConsumeOutcome> {
        let marker: Arc<dyn MessageMarker> = Arc::new(OffsetMarker {
            consumer: Arc::clone(consumer),
        });
        let context = consumer.context();

        if advance(context, handler.as_ref(), active)? {
            return Ok(ConsumeOutcome::SessionEnded);
        }
        let carried = lock(&self.carry).take();
        if let Some(delivery) = carried {
            feed_claim(delivery, handler, &marker, feeds, tasks).await;
        }

        loop {
            tokio::select! {
                () = self.close.closed() => return Ok(ConsumeOutcome::GroupClosed),
                () = context.wake.notified() => {
                    if advance(context, handler.as_ref(), active)? {
                        return Ok(ConsumeOutcome::SessionEnded);
                    }
                }
                Some(joined) = tasks.join_next() => join_result(joined)?,
                received = consumer.recv() => {
                    // Copy out before the next await; borrowed messages are not Send.
                    let delivery = match received {
                        Ok(message) => to_delivery(&message),
                        Err(e) => return Err(self.consume_error(e.to_string())),
                    };

                    // Rebalances run inside recv.
                    if advance(context, handler.as_ref(), active)? {
                        *lock(&self.carry) = Some(delivery);
                        return Ok(ConsumeOutcome::SessionEnded);
                    }
                    feed_claim(delivery, handler, &marker, feeds, tasks).await;
                }
            }
        }
    }
}

#[async_trait]
impl GroupSession for KafkaSession {
    fn member(&self) -> &str {
        &self.member
    }

    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn GroupHandler>,
    ) -> ProbeResult<ConsumeOutcome> {
        if self.close.is_closed() {
            return Ok(ConsumeOutcome::GroupClosed);
        }
        let Some(consumer) = self.consumer() else {
            return Ok(ConsumeOutcome::GroupClosed);
        };

        if !self.subscribed.swap(true, Ordering::AcqRel) {
            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer.subscribe(&topic_refs)?;
        }

        let mut active = None;
        let mut feeds = HashMap::new();
        let mut tasks = JoinSet::new();
        let outcome = self
            .pump(&consumer, &handler, &mut active, &mut feeds, &mut tasks)
            .await;

        drop(feeds);
        if outcome.is_err() {
            tasks.abort_all();
            return outcome;
        }
        while let Some(joined) = tasks.join_next().await {
            join_result(joined)?;
        }
        if let Some(claims) = active {
            handler.cleanup(&claims)?;
        }

        if matches!(outcome, Ok(ConsumeOutcome::GroupClosed)) {
            consumer.unsubscribe();
        }
        outcome
    }

    async fn close(&self) -> ProbeResult<()> {
        if !self.close.close() {
            return Err(ProbeError::SessionAlreadyClosed {
                member: self.member.clone(),
            });
        }
        lock(&self.consumer).take();
        info!(member = %self.member, "group session closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.close.is_closed()
    }
}
