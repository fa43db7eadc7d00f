//! Claim probe binary.
//!
//! Races competing consumers for a fresh topic and exits non-zero unless
//! every partition was claimed by exactly one of them.
//!
//! ```bash
//! claim-probe --brokers localhost:9092
//! claim-probe --brokers a:9092,b:9092 --workers 5 --partitions 2 --verbose
//! claim-probe --dry-run
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use claim_probe::{
    GroupBroker, KafkaBroker, KafkaVersion, MemoryBroker, OffsetReset, Orchestrator, ProbeConfig,
    ProbeResult, RaceReport,
};

/// Consumer-group exclusive partition claim probe.
#[derive(Parser, Debug)]
#[command(name = "claim-probe")]
#[command(author, about, long_about = None)]
struct Args {
    /// Kafka bootstrap brokers to connect to, as a comma-separated list.
    #[arg(long, value_delimiter = ',', required_unless_present = "dry_run")]
    brokers: Vec<String>,

    /// Kafka cluster version.
    #[arg(long = "version", default_value = "2.1.1", value_parser = KafkaVersion::parse)]
    kafka_version: KafkaVersion,

    /// Kafka consumer consume initial offset from oldest.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    oldest: bool,

    /// Forward client library logs.
    #[arg(long)]
    verbose: bool,

    /// Number of competing consumers.
    #[arg(long, default_value = "2")]
    workers: usize,

    /// Number of partitions on the probe topic.
    #[arg(long, default_value = "1")]
    partitions: i32,

    /// Topic creation deadline in seconds.
    #[arg(long, default_value = "60")]
    topic_timeout_secs: u64,

    /// Deadline in seconds for every consumer to finish its first rebalance.
    #[arg(long, default_value = "60")]
    ready_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Run against an in-process broker instead of a cluster.
    #[arg(long)]
    dry_run: bool,
}

impl Args {
    fn to_config(&self) -> ProbeResult<ProbeConfig> {
        let brokers = if self.dry_run && self.brokers.is_empty() {
            vec!["memory".to_string()]
        } else {
            self.brokers.clone()
        };
        let offset_reset = if self.oldest {
            OffsetReset::Oldest
        } else {
            OffsetReset::Newest
        };

        ProbeConfig::builder()
            .brokers(brokers)
            .version(self.kafka_version)
            .offset_reset(offset_reset)
            .verbose(self.verbose)
            .workers(self.workers)
            .partitions(self.partitions)
            .topic_timeout(Duration::from_secs(self.topic_timeout_secs))
            .ready_timeout(Duration::from_secs(self.ready_timeout_secs))
            .build()
    }
}

async fn run(args: &Args) -> ProbeResult<RaceReport> {
    let config = args.to_config()?;
    let broker: Arc<dyn GroupBroker> = if args.dry_run {
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(KafkaBroker::new(&config)?)
    };
    Orchestrator::new(config, broker).run().await
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Logs go to stderr.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {e}");
    }

    info!(
        brokers = ?args.brokers,
        version = %args.kafka_version,
        workers = args.workers,
        partitions = args.partitions,
        dry_run = args.dry_run,
        "Starting claim probe"
    );

    match run(&args).await {
        Ok(report) => {
            info!(
                topic = %report.topic,
                group = %report.group,
                topic_creation = ?report.topic_creation,
                claims = ?report.claims,
                closed = ?report.closed,
                "probe passed"
            );
        }
        Err(e) => {
            error!(error = %e, exit_code = e.exit_code(), "probe failed");
            std::process::exit(e.exit_code());
        }
    }
}
