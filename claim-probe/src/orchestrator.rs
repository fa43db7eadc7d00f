//! Rendezvous orchestration of the claim race.
//!
//! A run creates a fresh topic and group, starts every worker at once, waits
//! until each has been through a rebalance, and then checks that the group
//! protocol handed each partition to exactly one worker. Losers are closed
//! first, then the winners, and every worker task is joined before
//! [`Orchestrator::run`] returns.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ProbeConfig;
use crate::error::{ProbeError, ProbeResult};
use crate::evaluator::{evaluate_claims, ClaimVerdict};
use crate::naming;
use crate::session::{GroupBroker, TopicCreation, TopicSpec};
use crate::worker::{Worker, WorkerId, READY_BUFFER_PER_WORKER};

type WorkerTasks = JoinSet<(WorkerId, ProbeResult<()>)>;

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceReport {
    /// Probe topic.
    pub topic: String,
    /// Consumer group.
    pub group: String,
    /// How topic creation went.
    pub topic_creation: TopicCreation,
    /// Claimed-partition count per worker at evaluation time.
    pub claims: Vec<(WorkerId, usize)>,
    /// Workers that held partitions.
    pub winners: Vec<WorkerId>,
    /// Workers closed because they held nothing, in close order.
    pub closed: Vec<WorkerId>,
}

/// Drives one claim race against a broker.
pub struct Orchestrator {
    config: ProbeConfig,
    broker: Arc<dyn GroupBroker>,
}

impl Orchestrator {
    /// Creates an orchestrator for `config` using `broker`.
    #[must_use]
    pub fn new(config: ProbeConfig, broker: Arc<dyn GroupBroker>) -> Self {
        Self { config, broker }
    }

    /// Returns the run configuration.
    #[must_use]
    pub const fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Runs the race end to end.
    ///
    /// # Errors
    ///
    /// Every error is fatal for the run: connection and topic failures,
    /// consume failures of any worker, a readiness timeout, or a claim
    /// distribution that violates exclusive assignment.
    pub async fn run(&self) -> ProbeResult<RaceReport> {
        let cluster = self.broker.connect().await?;
        info!(
            brokers = ?cluster.brokers.iter().map(ToString::to_string).collect::<Vec<_>>(),
            origin = cluster.origin_broker,
            "client connected"
        );

        let topic = naming::topic_name();
        let spec = TopicSpec::new(
            topic.clone(),
            self.config.partitions,
            self.config.replication_factor,
        );
        let topic_creation = self
            .broker
            .create_topic(&spec, self.config.topic_timeout)
            .await?;
        match topic_creation {
            TopicCreation::Created => {
                info!(topic = %topic, partitions = spec.partitions, "new topic created");
            }
            TopicCreation::AlreadyExists => {
                warn!(topic = %topic, "topic already exists, continuing");
            }
        }

        let group = naming::group_name();
        info!(group = %group, "new group");

        let (claims, verdict, closed) = self.race(&topic, &group).await?;

        let report = RaceReport {
            topic,
            group,
            topic_creation,
            claims,
            winners: verdict.winners,
            closed,
        };
        info!(
            winners = ?report.winners,
            closed = ?report.closed,
            "exclusive claim verified"
        );
        Ok(report)
    }

    async fn race(
        &self,
        topic: &str,
        group: &str,
    ) -> ProbeResult<(Vec<(WorkerId, usize)>, ClaimVerdict, Vec<WorkerId>)> {
        let count = self.config.workers;
        let (ready_tx, mut ready_rx) = mpsc::channel(READY_BUFFER_PER_WORKER * count);

        let mut workers = Vec::with_capacity(count);
        for raw in 1..=count {
            let id = WorkerId::new(u32::try_from(raw).map_err(|_| {
                ProbeError::InvalidConfig(format!("too many workers: {count}"))
            })?);
            let session = self.broker.join_group(group, &id.member_name()).await?;
            workers.push(Arc::new(Worker::new(id, session, ready_tx.clone())));
        }
        drop(ready_tx);

        let mut tasks = WorkerTasks::new();
        for worker in &workers {
            info!(worker = %worker.id(), "starting worker");
            let worker = Arc::clone(worker);
            let topics = vec![topic.to_string()];
            tasks.spawn(async move { (worker.id(), worker.run(topics).await) });
        }

        let outcome = self.settle(&workers, &mut ready_rx, &mut tasks).await;
        let (claims, verdict) = match outcome {
            Ok(settled) => settled,
            Err(e) => {
                error!(error = %e, "race aborted");
                abort(&workers, &mut tasks).await;
                return Err(e);
            }
        };

        let mut closed = Vec::with_capacity(verdict.losers.len());
        for loser in &verdict.losers {
            let worker = worker_by_id(&workers, *loser)?;
            info!(worker = %loser, "trying to close worker without partition");
            if let Err(e) = worker.close().await {
                abort(&workers, &mut tasks).await;
                return Err(e);
            }
            info!(worker = %loser, "closed worker without partition");
            closed.push(*loser);
        }

        self.shutdown(&workers, &mut tasks).await?;
        Ok((claims, verdict, closed))
    }

    /// Waits for the rendezvous and evaluates the claims.
    async fn settle(
        &self,
        workers: &[Arc<Worker>],
        ready_rx: &mut mpsc::Receiver<WorkerId>,
        tasks: &mut WorkerTasks,
    ) -> ProbeResult<(Vec<(WorkerId, usize)>, ClaimVerdict)> {
        let expected = workers.len();
        let deadline = Instant::now() + self.config.ready_timeout;
        let mut ready = HashSet::with_capacity(expected);

        while ready.len() < expected {
            tokio::select! {
                signal = ready_rx.recv() => {
                    let id = signal.ok_or_else(|| {
                        ProbeError::WorkerAborted("readiness channel closed".to_string())
                    })?;
                    if ready.insert(id) {
                        info!(worker = %id, ready = ready.len(), expected, "worker ready");
                    }
                }
                Some(joined) = tasks.join_next() => early_exit(joined)?,
                () = tokio::time::sleep_until(deadline) => {
                    return Err(ProbeError::ReadyTimeout {
                        waited: self.config.ready_timeout,
                        ready: ready.len(),
                        expected,
                    });
                }
            }
        }
        info!("consumers up and running");

        #[allow(clippy::cast_sign_loss)] // Validated positive.
        let partitions = self.config.partitions as usize;
        let settle_deadline = Instant::now() + self.config.settle_timeout;
        while total_claims(workers) != partitions {
            tokio::select! {
                signal = ready_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
                Some(joined) = tasks.join_next() => early_exit(joined)?,
                () = tokio::time::sleep_until(settle_deadline) => {
                    warn!(
                        claimed = total_claims(workers),
                        partitions,
                        "claims did not settle"
                    );
                    break;
                }
            }
        }

        let claims: Vec<(WorkerId, usize)> = workers.iter().map(|w| (w.id(), w.claimed())).collect();
        info!(claims = ?claims, "evaluating claims");

        match evaluate_claims(&claims, partitions) {
            Ok(verdict) => Ok((claims, verdict)),
            Err(violation) => {
                error!(violation = %violation, claims = ?claims, "exclusive claim violated");
                Err(violation.into())
            }
        }
    }

    /// Closes every remaining session and joins all worker tasks.
    async fn shutdown(&self, workers: &[Arc<Worker>], tasks: &mut WorkerTasks) -> ProbeResult<()> {
        for worker in workers.iter().filter(|w| !w.is_closed()) {
            worker.close().await?;
            info!(worker = %worker.id(), "worker shut down");
        }

        let joined = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                let (id, result) = joined.map_err(|e| ProbeError::WorkerAborted(e.to_string()))?;
                if let Err(e) = result {
                    error!(worker = %id, error = %e, "worker failed during shutdown");
                    return Err(e);
                }
            }
            Ok(())
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(_) => {
                tasks.abort_all();
                Err(ProbeError::WorkerAborted(format!(
                    "workers still running after {:?}",
                    self.config.shutdown_timeout
                )))
            }
        }
    }
}

fn total_claims(workers: &[Arc<Worker>]) -> usize {
    workers.iter().map(|w| w.claimed()).sum()
}

fn worker_by_id(workers: &[Arc<Worker>], id: WorkerId) -> ProbeResult<&Arc<Worker>> {
    workers
        .iter()
        .find(|w| w.id() == id)
        .ok_or_else(|| ProbeError::WorkerAborted(format!("unknown worker {id}")))
}

/// A worker task must not finish before the rendezvous.
fn early_exit(joined: Result<(WorkerId, ProbeResult<()>), JoinError>) -> ProbeResult<()> {
    let (id, result) = joined.map_err(|e| ProbeError::WorkerAborted(e.to_string()))?;
    result?;
    Err(ProbeError::WorkerAborted(format!(
        "worker {id} stopped before the rendezvous"
    )))
}

/// Tears down every worker after a fatal error.
async fn abort(workers: &[Arc<Worker>], tasks: &mut WorkerTasks) {
    for worker in workers.iter().filter(|w| !w.is_closed()) {
        if let Err(e) = worker.close().await {
            debug!(worker = %worker.id(), error = %e, "close during teardown failed");
        }
    }
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
}
