//! In-process broker.
//!
//! Runs the consumer-group protocol inside the process so races can be
//! exercised without a cluster. Every membership change starts a new
//! generation; each member's session ends on the next generation and the
//! member rejoins. Assignment is computed from the member list under one lock,
//! so a generation never hands a partition to two members unless a faulty
//! [`Assignor`] is selected.
//!
//! Fault injection covers the failure paths of a run: unreachable cluster,
//! rejected topic creation, failing consume calls, members that never finish
//! a rebalance, and broken assignors.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{ProbeError, ProbeResult};
use crate::session::{
    join_result, BrokerInfo, Claim, ClaimStream, CloseSignal, ClusterInfo, ConsumeOutcome,
    Delivery, GroupBroker, GroupHandler, GroupSession, MessageMarker, TopicCreation, TopicSpec,
};

/// Partition assignment strategy of the in-process coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Assignor {
    /// Contiguous ranges over members in join order.
    #[default]
    Range,
    /// Broken: every member gets every partition.
    Everyone,
    /// Broken: nobody gets anything.
    Nobody,
}

impl Assignor {
    fn assign(self, partitions: i32, members: usize, index: usize) -> Vec<i32> {
        match self {
            Self::Range => {
                let Ok(total) = usize::try_from(partitions) else {
                    return Vec::new();
                };
                let per_member = total / members;
                let extra = total % members;
                let start = index * per_member + index.min(extra);
                let len = per_member + usize::from(index < extra);
                (start..start + len)
                    .filter_map(|p| i32::try_from(p).ok())
                    .collect()
            }
            Self::Everyone => (0..partitions).collect(),
            Self::Nobody => Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Partition {
    log: Vec<(Bytes, i64)>,
}

#[derive(Debug)]
struct Group {
    members: Vec<String>,
    generation: watch::Sender<u64>,
}

impl Group {
    fn new() -> Self {
        let (generation, _rx) = watch::channel(0);
        Self {
            members: Vec::new(),
            generation,
        }
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

type OffsetKey = (String, String, i32);

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<Partition>>,
    groups: HashMap<String, Group>,
    committed: HashMap<OffsetKey, i64>,
    marks: HashMap<OffsetKey, Vec<i64>>,
    assignor: Assignor,
    connect_failure: Option<String>,
    topic_failure: Option<String>,
    report_existing: bool,
    consume_failures: HashMap<String, String>,
    rejoin_failures: HashMap<String, String>,
    stalled: HashSet<String>,
}

/// A member's view of one generation.
struct SessionView {
    generation: u64,
    generations: watch::Receiver<u64>,
    claims: Vec<Claim>,
}

/// Broker that keeps topics and groups in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    /// Creates an empty broker with the range assignor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty broker with the given assignor.
    #[must_use]
    pub fn with_assignor(assignor: Assignor) -> Self {
        let broker = Self::new();
        broker.lock().assignor = assignor;
        broker
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `connect` fail with `reason`.
    pub fn fail_connect(&self, reason: impl Into<String>) {
        self.lock().connect_failure = Some(reason.into());
    }

    /// Makes every topic creation fail with `reason`.
    pub fn fail_topic_creation(&self, reason: impl Into<String>) {
        self.lock().topic_failure = Some(reason.into());
    }

    /// Makes topic creation report "already exists" while still creating the
    /// topic.
    pub fn report_topics_existing(&self) {
        self.lock().report_existing = true;
    }

    /// Makes the next consume call of `member` fail with `message`.
    pub fn fail_consume(&self, member: impl Into<String>, message: impl Into<String>) {
        self.lock()
            .consume_failures
            .insert(member.into(), message.into());
    }

    /// Makes the first consume call of `member` that rejoins the group after
    /// a rebalance fail with `message`. The member has completed a setup by
    /// then.
    pub fn fail_rejoin(&self, member: impl Into<String>, message: impl Into<String>) {
        self.lock()
            .rejoin_failures
            .insert(member.into(), message.into());
    }

    /// Makes `member` block in consume without ever finishing a rebalance.
    pub fn stall(&self, member: impl Into<String>) {
        self.lock().stalled.insert(member.into());
    }

    /// Appends a message and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::UnknownTopic`] if the topic or partition does
    /// not exist.
    pub fn produce(&self, topic: &str, partition: i32, value: impl Into<Bytes>) -> ProbeResult<i64> {
        let unknown = || ProbeError::UnknownTopic {
            topic: topic.to_string(),
        };
        let index = usize::try_from(partition).map_err(|_| unknown())?;
        let mut state = self.lock();
        let partition = state
            .topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(index))
            .ok_or_else(unknown)?;
        let offset = i64::try_from(partition.log.len()).unwrap_or(i64::MAX);
        partition.log.push((value.into(), offset));
        Ok(offset)
    }

    /// Returns the partition count of `topic`.
    #[must_use]
    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.lock().topics.get(topic).map(Vec::len)
    }

    /// Returns the offsets marked by `group` on a partition, in mark order.
    #[must_use]
    pub fn marks(&self, group: &str, topic: &str, partition: i32) -> Vec<i64> {
        self.lock()
            .marks
            .get(&(group.to_string(), topic.to_string(), partition))
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the next offset `group` will read on a partition.
    #[must_use]
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Returns the active members of `group` in join order.
    #[must_use]
    pub fn members(&self, group: &str) -> Vec<String> {
        self.lock()
            .groups
            .get(group)
            .map(|g| g.members.clone())
            .unwrap_or_default()
    }

    /// Returns every group that has ever had a member.
    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        self.lock().groups.keys().cloned().collect()
    }

    /// Returns the current generation of `group`.
    #[must_use]
    pub fn generation(&self, group: &str) -> u64 {
        self.lock()
            .groups
            .get(group)
            .map_or(0, |g| *g.generation.borrow())
    }

    fn join(&self, group: &str, member: &str, topics: &[String]) -> ProbeResult<SessionView> {
        let mut state = self.lock();
        let mut subscribed = Vec::with_capacity(topics.len());
        for topic in topics {
            let partitions = state
                .topics
                .get(topic)
                .ok_or_else(|| ProbeError::UnknownTopic {
                    topic: topic.clone(),
                })?
                .len();
            subscribed.push((topic.clone(), partitions));
        }
        subscribed.sort();

        let assignor = state.assignor;
        let entry = state.groups.entry(group.to_string()).or_insert_with(Group::new);
        if !entry.members.iter().any(|m| m == member) {
            entry.members.push(member.to_string());
            entry.bump();
        }

        let index = entry
            .members
            .iter()
            .position(|m| m == member)
            .unwrap_or_default();
        let claims = subscribed
            .iter()
            .flat_map(|(topic, count)| {
                let count = i32::try_from(*count).unwrap_or(i32::MAX);
                assignor
                    .assign(count, entry.members.len(), index)
                    .into_iter()
                    .map(move |p| Claim::new(topic.clone(), p))
            })
            .collect();

        let mut generations = entry.generation.subscribe();
        let generation = *generations.borrow_and_update();
        Ok(SessionView {
            generation,
            generations,
            claims,
        })
    }

    fn leave(&self, group: &str, member: &str) {
        let mut state = self.lock();
        if let Some(entry) = state.groups.get_mut(group) {
            let before = entry.members.len();
            entry.members.retain(|m| m != member);
            if entry.members.len() != before {
                entry.bump();
            }
        }
    }

    fn backlog(&self, group: &str, claim: &Claim) -> Vec<Delivery> {
        let state = self.lock();
        let start = state
            .committed
            .get(&(group.to_string(), claim.topic.clone(), claim.partition))
            .copied()
            .unwrap_or(0);
        let Ok(index) = usize::try_from(claim.partition) else {
            return Vec::new();
        };
        let Some(partition) = state
            .topics
            .get(&claim.topic)
            .and_then(|partitions| partitions.get(index))
        else {
            return Vec::new();
        };
        partition
            .log
            .iter()
            .filter(|(_, offset)| *offset >= start)
            .map(|(value, offset)| Delivery {
                topic: claim.topic.clone(),
                partition: claim.partition,
                offset: *offset,
                key: None,
                value: Some(value.clone()),
                timestamp_ms: None,
            })
            .collect()
    }
}

#[async_trait]
impl GroupBroker for MemoryBroker {
    async fn connect(&self) -> ProbeResult<ClusterInfo> {
        if let Some(message) = self.lock().connect_failure.clone() {
            return Err(ProbeError::Connect { message });
        }
        Ok(ClusterInfo {
            brokers: vec![BrokerInfo {
                id: 0,
                host: "memory".to_string(),
                port: 0,
            }],
            origin_broker: 0,
        })
    }

    async fn create_topic(
        &self,
        spec: &TopicSpec,
        _timeout: Duration,
    ) -> ProbeResult<TopicCreation> {
        let mut state = self.lock();
        if let Some(reason) = state.topic_failure.clone() {
            return Err(ProbeError::TopicCreation {
                topic: spec.name.clone(),
                reason,
            });
        }
        let partitions = usize::try_from(spec.partitions).unwrap_or(0);
        if partitions == 0 || spec.replication_factor != 1 {
            return Err(ProbeError::TopicCreation {
                topic: spec.name.clone(),
                reason: format!(
                    "unsupported layout: {} partitions, replication factor {}",
                    spec.partitions, spec.replication_factor
                ),
            });
        }

        let existed = state.topics.contains_key(&spec.name);
        state
            .topics
            .entry(spec.name.clone())
            .or_insert_with(|| (0..partitions).map(|_| Partition::default()).collect());

        if existed || state.report_existing {
            Ok(TopicCreation::AlreadyExists)
        } else {
            Ok(TopicCreation::Created)
        }
    }

    async fn join_group(&self, group: &str, member: &str) -> ProbeResult<Arc<dyn GroupSession>> {
        Ok(Arc::new(MemorySession {
            broker: self.clone(),
            group: group.to_string(),
            member: member.to_string(),
            close: CloseSignal::new(),
        }))
    }
}

/// Records marks in the broker's offset store.
struct MemoryMarker {
    broker: MemoryBroker,
    group: String,
}

impl MessageMarker for MemoryMarker {
    fn mark_message(&self, delivery: &Delivery) -> ProbeResult<()> {
        let key = (
            self.group.clone(),
            delivery.topic.clone(),
            delivery.partition,
        );
        let mut state = self.broker.lock();
        state.marks.entry(key.clone()).or_default().push(delivery.offset);
        state.committed.insert(key, delivery.offset + 1);
        Ok(())
    }
}

/// Waits until `generations` moves past `generation`.
async fn next_generation(generations: &mut watch::Receiver<u64>, generation: u64) {
    while *generations.borrow_and_update() == generation {
        if generations.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A member of an in-process group.
pub struct MemorySession {
    broker: MemoryBroker,
    group: String,
    member: String,
    close: CloseSignal,
}

impl MemorySession {
    async fn run_session(
        &self,
        view: &mut SessionView,
        handler: &Arc<dyn GroupHandler>,
    ) -> ProbeResult<ConsumeOutcome> {
        let marker: Arc<dyn MessageMarker> = Arc::new(MemoryMarker {
            broker: self.broker.clone(),
            group: self.group.clone(),
        });

        let mut feeds = Vec::with_capacity(view.claims.len());
        let mut tasks = JoinSet::new();
        for claim in &view.claims {
            let (tx, mut stream) = ClaimStream::channel(claim.clone());
            let handler = Arc::clone(handler);
            let marker = Arc::clone(&marker);
            tasks.spawn(async move { handler.consume_claim(marker.as_ref(), &mut stream).await });

            for delivery in self.broker.backlog(&self.group, claim) {
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
            feeds.push(tx);
        }

        let outcome = loop {
            tokio::select! {
                () = self.close.closed() => break Ok(ConsumeOutcome::GroupClosed),
                () = next_generation(&mut view.generations, view.generation) => {
                    break Ok(ConsumeOutcome::SessionEnded);
                }
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = join_result(joined) {
                        break Err(e);
                    }
                }
            }
        };

        drop(feeds);
        if outcome.is_err() {
            tasks.abort_all();
            return outcome;
        }
        while let Some(joined) = tasks.join_next().await {
            join_result(joined)?;
        }
        outcome
    }
}

#[async_trait]
impl GroupSession for MemorySession {
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

        let (failure, stalled) = {
            let mut state = self.broker.lock();
            let rejoining = state
                .groups
                .get(&self.group)
                .is_some_and(|g| g.members.contains(&self.member));
            let mut failure = state.consume_failures.remove(&self.member);
            if failure.is_none() && rejoining {
                failure = state.rejoin_failures.remove(&self.member);
            }
            (failure, state.stalled.contains(&self.member))
        };
        if let Some(message) = failure {
            return Err(ProbeError::Consume {
                member: self.member.clone(),
                message,
            });
        }
        if stalled {
            debug!(member = %self.member, "member stalled before rebalance");
            self.close.closed().await;
            return Ok(ConsumeOutcome::GroupClosed);
        }

        let mut view = self.broker.join(&self.group, &self.member, topics)?;
        debug!(
            member = %self.member,
            generation = view.generation,
            claims = view.claims.len(),
            "session started"
        );

        handler.setup(&view.claims)?;
        let outcome = self.run_session(&mut view, &handler).await?;
        handler.cleanup(&view.claims)?;

        if outcome == ConsumeOutcome::GroupClosed {
            self.broker.leave(&self.group, &self.member);
        }
        Ok(outcome)
    }

    async fn close(&self) -> ProbeResult<()> {
        if !self.close.close() {
            return Err(ProbeError::SessionAlreadyClosed {
                member: self.member.clone(),
            });
        }
        // Leave now so the remaining members rebalance without waiting for
        // this member's consume loop to notice.
        self.broker.leave(&self.group, &self.member);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.close.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_assignor_splits_contiguously() {
        let a = Assignor::Range;
        assert_eq!(a.assign(1, 2, 0), vec![0]);
        assert!(a.assign(1, 2, 1).is_empty());
        assert_eq!(a.assign(5, 2, 0), vec![0, 1, 2]);
        assert_eq!(a.assign(5, 2, 1), vec![3, 4]);
        assert_eq!(a.assign(2, 5, 1), vec![1]);
        assert!(a.assign(2, 5, 4).is_empty());
    }

    #[test]
    fn test_faulty_assignors() {
        assert_eq!(Assignor::Everyone.assign(2, 3, 2), vec![0, 1]);
        assert!(Assignor::Nobody.assign(2, 3, 0).is_empty());
    }

    #[tokio::test]
    async fn test_create_topic_reports_existing() {
        let broker = MemoryBroker::new();
        let spec = TopicSpec::new("t", 1, 1);
        let timeout = Duration::from_secs(1);

        assert_eq!(
            broker.create_topic(&spec, timeout).await.unwrap(),
            TopicCreation::Created
        );
        assert_eq!(
            broker.create_topic(&spec, timeout).await.unwrap(),
            TopicCreation::AlreadyExists
        );
        assert_eq!(broker.partition_count("t"), Some(1));
    }

    #[tokio::test]
    async fn test_create_topic_failure_injected() {
        let broker = MemoryBroker::new();
        broker.fail_topic_creation("TopicAuthorizationFailed");

        let err = broker
            .create_topic(&TopicSpec::new("t", 1, 1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::TopicCreation { .. }));
        assert_eq!(broker.partition_count("t"), None);
    }

    #[tokio::test]
    async fn test_produce_assigns_sequential_offsets() {
        let broker = MemoryBroker::new();
        broker
            .create_topic(&TopicSpec::new("t", 2, 1), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(broker.produce("t", 1, "a").unwrap(), 0);
        assert_eq!(broker.produce("t", 1, "b").unwrap(), 1);
        assert_eq!(broker.produce("t", 0, "c").unwrap(), 0);
        assert!(broker.produce("t", 2, "d").is_err());
        assert!(broker.produce("missing", 0, "d").is_err());
    }

    #[tokio::test]
    async fn test_join_and_leave_bump_generation() {
        let broker = MemoryBroker::new();
        broker
            .create_topic(&TopicSpec::new("t", 1, 1), Duration::from_secs(1))
            .await
            .unwrap();
        let topics = vec!["t".to_string()];

        let first = broker.join("g", "worker-1", &topics).unwrap();
        let second = broker.join("g", "worker-2", &topics).unwrap();
        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 2);
        assert_eq!(first.claims, vec![Claim::new("t", 0)]);
        assert!(second.claims.is_empty());
        assert_eq!(broker.members("g"), vec!["worker-1", "worker-2"]);

        broker.leave("g", "worker-1");
        assert_eq!(broker.generation("g"), 3);
        assert_eq!(broker.members("g"), vec!["worker-2"]);

        let rejoined = broker.join("g", "worker-2", &topics).unwrap();
        assert_eq!(rejoined.claims, vec![Claim::new("t", 0)]);
    }

    #[tokio::test]
    async fn test_join_unknown_topic_fails() {
        let broker = MemoryBroker::new();
        let err = broker
            .join("g", "worker-1", &["missing".to_string()])
            .err()
            .unwrap();
        assert!(matches!(err, ProbeError::UnknownTopic { .. }));
    }

    struct Quiet;

    #[async_trait]
    impl GroupHandler for Quiet {
        fn setup(&self, _claims: &[Claim]) -> ProbeResult<()> {
            Ok(())
        }

        fn cleanup(&self, _claims: &[Claim]) -> ProbeResult<()> {
            Ok(())
        }

        async fn consume_claim(
            &self,
            _marker: &dyn MessageMarker,
            claim: &mut ClaimStream,
        ) -> ProbeResult<()> {
            while claim.next().await.is_some() {}
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rejoin_failure_skips_first_join() {
        let broker = MemoryBroker::new();
        broker
            .create_topic(&TopicSpec::new("t", 1, 1), Duration::from_secs(1))
            .await
            .unwrap();
        broker.fail_rejoin("worker-1", "rebalance in progress");
        let topics = vec!["t".to_string()];
        let session = broker.join_group("g", "worker-1").await.unwrap();

        let first = {
            let (session, topics) = (Arc::clone(&session), topics.clone());
            tokio::spawn(async move { session.consume(&topics, Arc::new(Quiet)).await })
        };
        while broker.members("g").is_empty() {
            tokio::task::yield_now().await;
        }
        broker.join("g", "worker-2", &topics).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), ConsumeOutcome::SessionEnded);

        let err = session.consume(&topics, Arc::new(Quiet)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Consume { member, .. } if member == "worker-1"));
    }

    #[tokio::test]
    async fn test_session_close_twice_is_rejected() {
        let broker = MemoryBroker::new();
        let session = broker.join_group("g", "worker-1").await.unwrap();

        session.close().await.unwrap();
        assert!(session.is_closed());
        let err = session.close().await.unwrap_err();
        assert!(matches!(err, ProbeError::SessionAlreadyClosed { member } if member == "worker-1"));
    }
}
