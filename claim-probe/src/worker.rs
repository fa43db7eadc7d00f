//! Competing consumer workers.
//!
//! A [`Worker`] is one member of the probe's consumer group. It owns its
//! session handle and records how many partitions the latest rebalance gave
//! it. After every setup it sends one readiness event to the orchestrator.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info};

use crate::error::{ProbeError, ProbeResult};
use crate::session::{Claim, ClaimStream, ConsumeOutcome, GroupHandler, GroupSession, MessageMarker};

/// Readiness events buffered per worker. Setup never blocks on a full buffer.
pub const READY_BUFFER_PER_WORKER: usize = 4;

/// Identity of a worker within one run. Starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u32);

impl WorkerId {
    /// Creates a new worker id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the group member name for this worker.
    #[must_use]
    pub fn member_name(self) -> String {
        format!("worker-{}", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Group callbacks of a worker.
///
/// Kept apart from [`Worker`] so the session can hold it without owning the
/// session handle back.
struct ClaimRecorder {
    id: WorkerId,
    claimed: AtomicUsize,
    ready: mpsc::Sender<WorkerId>,
}

#[async_trait]
impl GroupHandler for ClaimRecorder {
    fn setup(&self, claims: &[Claim]) -> ProbeResult<()> {
        // Release pairs with the acquire in `Worker::claimed`; the readiness
        // send below publishes this store to the orchestrator.
        self.claimed.store(claims.len(), Ordering::Release);
        info!(worker = %self.id, claims = claims.len(), "consumer setup");

        match self.ready.try_send(self.id) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(worker = %self.id, "readiness buffer full, signal dropped");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(worker = %self.id, "orchestrator stopped listening for readiness");
            }
        }
        Ok(())
    }

    fn cleanup(&self, claims: &[Claim]) -> ProbeResult<()> {
        info!(worker = %self.id, claims = claims.len(), "consumer cleanup");
        Ok(())
    }

    async fn consume_claim(
        &self,
        marker: &dyn MessageMarker,
        claim: &mut ClaimStream,
    ) -> ProbeResult<()> {
        // One delivery at a time: order within the partition is the order of marks.
        while let Some(delivery) = claim.next().await {
            info!(
                worker = %self.id,
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                timestamp_ms = ?delivery.timestamp_ms,
                value = %delivery.value.as_deref().map(String::from_utf8_lossy).unwrap_or_default(),
                "message claimed"
            );
            marker
                .mark_message(&delivery)
                .map_err(|e| ProbeError::Handler {
                    worker: self.id,
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }
}

/// One competing consumer.
pub struct Worker {
    recorder: Arc<ClaimRecorder>,
    session: Arc<dyn GroupSession>,
}

impl Worker {
    /// Creates a worker that signals readiness on `ready`.
    #[must_use]
    pub fn new(id: WorkerId, session: Arc<dyn GroupSession>, ready: mpsc::Sender<WorkerId>) -> Self {
        Self {
            recorder: Arc::new(ClaimRecorder {
                id,
                claimed: AtomicUsize::new(0),
                ready,
            }),
            session,
        }
    }

    /// Returns the worker id.
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.recorder.id
    }

    /// Returns the partition count recorded by the latest setup.
    #[must_use]
    pub fn claimed(&self) -> usize {
        self.recorder.claimed.load(Ordering::Acquire)
    }

    /// Returns the group handler driving this worker's claim count.
    #[must_use]
    pub fn handler(&self) -> Arc<dyn GroupHandler> {
        Arc::clone(&self.recorder) as Arc<dyn GroupHandler>
    }

    /// Returns true once the session handle has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Closes the worker's session handle.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::SessionAlreadyClosed`] if it was closed before.
    pub async fn close(&self) -> ProbeResult<()> {
        self.session.close().await
    }

    /// Runs the consume loop until the session is closed.
    ///
    /// Each `consume` call covers one session; a rebalance ends it and the
    /// loop joins again.
    ///
    /// # Errors
    ///
    /// Returns the first consume error. Callers treat it as fatal.
    pub async fn run(&self, topics: Vec<String>) -> ProbeResult<()> {
        let handler = self.handler();
        loop {
            debug!(worker = %self.id(), "consume");
            match self.session.consume(&topics, Arc::clone(&handler)).await {
                Ok(ConsumeOutcome::SessionEnded) => {}
                Ok(ConsumeOutcome::GroupClosed) => {
                    debug!(worker = %self.id(), "consumer group closed");
                    return Ok(());
                }
                Err(e) => {
                    error!(worker = %self.id(), error = %e, "consume failed");
                    return Err(e);
                }
            }
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id())
            .field("member", &self.session.member())
            .field("claimed", &self.claimed())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::*;
    use crate::session::Delivery;

    struct RecordingMarker {
        marked: Mutex<Vec<(i32, i64)>>,
        fail_at: Option<i64>,
    }

    impl RecordingMarker {
        fn new(fail_at: Option<i64>) -> Self {
            Self {
                marked: Mutex::new(Vec::new()),
                fail_at,
            }
        }
    }

    impl MessageMarker for RecordingMarker {
        fn mark_message(&self, delivery: &Delivery) -> ProbeResult<()> {
            if self.fail_at == Some(delivery.offset) {
                return Err(ProbeError::Consume {
                    member: "worker-1".to_string(),
                    message: "offset store failed".to_string(),
                });
            }
            self.marked
                .lock()
                .unwrap()
                .push((delivery.partition, delivery.offset));
            Ok(())
        }
    }

    fn delivery(offset: i64) -> Delivery {
        Delivery {
            topic: "t".to_string(),
            partition: 0,
            offset,
            key: None,
            value: Some(Bytes::from(format!("m{offset}"))),
            timestamp_ms: Some(1_700_000_000_000),
        }
    }

    fn recorder(ready: mpsc::Sender<WorkerId>) -> ClaimRecorder {
        ClaimRecorder {
            id: WorkerId::new(1),
            claimed: AtomicUsize::new(0),
            ready,
        }
    }

    #[test]
    fn test_worker_id_names() {
        let id = WorkerId::new(2);
        assert_eq!(id.get(), 2);
        assert_eq!(id.to_string(), "2");
        assert_eq!(id.member_name(), "worker-2");
    }

    #[tokio::test]
    async fn test_setup_records_claims_before_signal() {
        let (tx, mut rx) = mpsc::channel(READY_BUFFER_PER_WORKER);
        let recorder = Arc::new(recorder(tx));

        let writer = {
            let recorder = Arc::clone(&recorder);
            tokio::spawn(async move {
                recorder
                    .setup(&[Claim::new("t", 0), Claim::new("t", 1)])
                    .unwrap();
            })
        };

        assert_eq!(rx.recv().await, Some(WorkerId::new(1)));
        assert_eq!(recorder.claimed.load(Ordering::Acquire), 2);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_last_writer_wins() {
        let (tx, mut rx) = mpsc::channel(READY_BUFFER_PER_WORKER);
        let recorder = recorder(tx);

        recorder.setup(&[Claim::new("t", 0)]).unwrap();
        recorder.setup(&[]).unwrap();

        assert_eq!(rx.recv().await, Some(WorkerId::new(1)));
        assert_eq!(rx.recv().await, Some(WorkerId::new(1)));
        assert_eq!(recorder.claimed.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_setup_does_not_block_on_full_buffer() {
        let (tx, rx) = mpsc::channel(1);
        let recorder = recorder(tx);

        for _ in 0..3 {
            recorder.setup(&[Claim::new("t", 0)]).unwrap();
        }
        drop(rx);
        recorder.setup(&[]).unwrap();
        assert_eq!(recorder.claimed.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_consume_claim_marks_in_delivery_order() {
        let (ready, _rx) = mpsc::channel(READY_BUFFER_PER_WORKER);
        let recorder = recorder(ready);
        let marker = RecordingMarker::new(None);

        let (tx, mut stream) = ClaimStream::channel(Claim::new("t", 0));
        for offset in 0..20 {
            tx.send(delivery(offset)).await.unwrap();
        }
        drop(tx);

        recorder.consume_claim(&marker, &mut stream).await.unwrap();

        let marked = marker.marked.lock().unwrap().clone();
        let expected: Vec<(i32, i64)> = (0..20).map(|o| (0, o)).collect();
        assert_eq!(marked, expected);
    }

    #[tokio::test]
    async fn test_consume_claim_stops_on_mark_failure() {
        let (ready, _rx) = mpsc::channel(READY_BUFFER_PER_WORKER);
        let recorder = recorder(ready);
        let marker = RecordingMarker::new(Some(3));

        let (tx, mut stream) = ClaimStream::channel(Claim::new("t", 0));
        for offset in 0..6 {
            tx.send(delivery(offset)).await.unwrap();
        }
        drop(tx);

        let err = recorder
            .consume_claim(&marker, &mut stream)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Handler { worker, .. } if worker == WorkerId::new(1)));
        assert_eq!(marker.marked.lock().unwrap().len(), 3);
    }
}
