//! # Path Verifier Entry Point
//!
//! Loads the policy, starts the consumer task and pumps telemetry JSON lines
//! from a file or stdin into it. End of input or Ctrl-C closes the queue;
//! buffered reports are drained before the run summary is logged.
//!
//! Usage: `path-verifier [POLICY]`. Everything else comes from
//! `PATH_VERIFIER_*` environment variables and `RUST_LOG`.

use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use policy_engine::Policy;
use verifier::{
    channel, source, FanoutSink, JsonLinesSink, LogSink, ReportRecorder, Verifier,
    VerifierConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = VerifierConfig::from_env()?;
    if let Some(path) = std::env::args().nth(1) {
        config.policy_path = PathBuf::from(path);
    }

    info!("Loading policy from {}", config.policy_path.display());
    let policy = match Policy::load(&config.policy_path) {
        Ok(policy) => Arc::new(policy),
        Err(e) => {
            error!("Failed to load policy: {}", e);
            return Err(e.into());
        }
    };
    info!(
        "Policy loaded: sha256 {}, {} connections, {} checks across {} flow matchers",
        policy.digest(),
        policy.connection_count(),
        policy.chain_count(),
        policy.queries().len()
    );
    info!(
        "Queue capacity {} ({:?} on overflow); retention: max hops {:?}, {} reports per hop, window {:?}",
        config.queue.capacity,
        config.queue.overflow,
        config.retention.max_hops,
        config.retention.max_reports_per_hop,
        config.retention.window
    );

    let mut sink = FanoutSink::new().with(LogSink);
    if config.emit_json {
        sink = sink.with(JsonLinesSink::new(std::io::stdout()));
    }
    let mut verifier = Verifier::new(Arc::clone(&policy), config.retention.clone()).with_sink(sink);
    if let Some(recorder_config) = &config.recorder {
        verifier = verifier.with_recorder(ReportRecorder::open(recorder_config)?);
    }

    let (sender, receiver) = channel(&config.queue)?;
    let consumer = tokio::spawn(verifier.run(receiver));

    let input = source::open_input(config.input_path.as_deref()).await?;
    tokio::select! {
        result = source::pump(input, &sender) => match result {
            Ok(stats) => info!(
                "Telemetry input finished: {} reports forwarded, {} malformed lines skipped",
                stats.forwarded, stats.malformed
            ),
            Err(e) => error!("Telemetry input stopped: {}", e),
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, draining buffered reports");
        }
    }
    drop(sender);

    let summary = consumer.await?;
    info!(
        "Run complete: {} reports processed, {} matches, {} dropped, {} recorder failures",
        summary.processed, summary.matches, summary.dropped, summary.recorder_failures
    );
    info!(
        "Adjacency graph: {} hops, {} reports retained, {} hops evicted, {} reports trimmed",
        summary.graph.hops,
        summary.graph.retained_reports,
        summary.graph.evicted_hops,
        summary.graph.trimmed_reports
    );

    Ok(())
}
