//! # Ingestion Pipeline
//!
//! Producers push reports into a bounded queue; one consumer task drains it
//! and drives the verification engine. The queue is the only serialization
//! point, so the adjacency graph never needs a lock.
//!
//! Shutdown is by closing the queue: once every [`ReportSender`] is dropped
//! the consumer processes what is still buffered, flushes its sink and
//! recorder, and returns a [`RunSummary`].

use log::{debug, error, info};
use parking_lot::RwLock;
use policy_engine::Policy;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::adjacency::{GraphStats, RetentionPolicy};
use crate::engine::VerificationEngine;
use crate::error::{Result, VerifierError};
use crate::recorder::ReportRecorder;
use crate::sink::{LogSink, MatchSink};
use crate::telemetry::Report;

// ============================================================================
// QUEUE
// ============================================================================

/// What `send` does when the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for the consumer to free a slot.
    #[default]
    Block,
    /// Discard the incoming report and count it.
    DropNewest,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "drop" | "drop_newest" | "drop-newest" => Ok(OverflowPolicy::DropNewest),
            other => Err(format!("expected 'block' or 'drop', got '{}'", other)),
        }
    }
}

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Reports buffered between producers and the consumer
    pub capacity: usize,
    /// Behavior when the buffer is full
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// Result of handing a report to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    Dropped,
}

/// Live counters shared by producers and the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub processed: u64,
    pub matches: u64,
    pub dropped: u64,
    pub recorder_failures: u64,
}

/// Producer handle. Clone it to feed the queue from several tasks.
#[derive(Debug, Clone)]
pub struct ReportSender {
    tx: mpsc::Sender<Report>,
    overflow: OverflowPolicy,
    stats: Arc<RwLock<PipelineStats>>,
}

impl ReportSender {
    /// Enqueues a report according to the overflow policy.
    pub async fn send(&self, report: Report) -> Result<SendOutcome> {
        match self.overflow {
            OverflowPolicy::Block => self
                .tx
                .send(report)
                .await
                .map(|_| SendOutcome::Queued)
                .map_err(|_| VerifierError::QueueClosed),
            OverflowPolicy::DropNewest => match self.tx.try_send(report) {
                Ok(()) => Ok(SendOutcome::Queued),
                Err(TrySendError::Full(_)) => {
                    self.stats.write().dropped += 1;
                    Ok(SendOutcome::Dropped)
                }
                Err(TrySendError::Closed(_)) => Err(VerifierError::QueueClosed),
            },
        }
    }

    /// True once the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Snapshot of the shared counters.
    pub fn stats(&self) -> PipelineStats {
        *self.stats.read()
    }
}

/// Consumer end of the queue.
#[derive(Debug)]
pub struct ReportReceiver {
    rx: mpsc::Receiver<Report>,
    stats: Arc<RwLock<PipelineStats>>,
}

impl ReportReceiver {
    /// Takes a buffered report without waiting.
    pub fn try_recv(&mut self) -> Option<Report> {
        self.rx.try_recv().ok()
    }
}

/// Creates the bounded report queue.
pub fn channel(config: &QueueConfig) -> Result<(ReportSender, ReportReceiver)> {
    if config.capacity == 0 {
        return Err(VerifierError::config("capacity", "must be at least 1"));
    }
    let (tx, rx) = mpsc::channel(config.capacity);
    let stats = Arc::new(RwLock::new(PipelineStats::default()));
    Ok((
        ReportSender {
            tx,
            overflow: config.overflow,
            stats: Arc::clone(&stats),
        },
        ReportReceiver { rx, stats },
    ))
}

// ============================================================================
// CONSUMER
// ============================================================================

/// Final accounting returned when the consumer stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub processed: u64,
    pub matches: u64,
    pub dropped: u64,
    pub recorder_failures: u64,
    pub graph: GraphStats,
}

/// The consumer: engine, match sink and optional recorder.
pub struct Verifier {
    engine: VerificationEngine,
    sink: Box<dyn MatchSink>,
    recorder: Option<ReportRecorder>,
    recorder_failures: u64,
}

impl Verifier {
    /// Verifier that logs matches.
    pub fn new(policy: Arc<Policy>, retention: RetentionPolicy) -> Self {
        Self {
            engine: VerificationEngine::new(policy, retention),
            sink: Box::new(LogSink),
            recorder: None,
            recorder_failures: 0,
        }
    }

    pub fn with_sink(mut self, sink: impl MatchSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn with_recorder(mut self, recorder: ReportRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn engine(&self) -> &VerificationEngine {
        &self.engine
    }

    /// Records, verifies and delivers one report. Returns the number of
    /// match events it produced.
    pub fn process(&mut self, report: Report) -> usize {
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.record(&report) {
                error!("Failed to record report: {}", e);
                self.recorder_failures += 1;
            }
        }

        let events = self.engine.ingest(report);
        for event in &events {
            self.sink.on_match(event);
        }
        events.len()
    }

    /// Recorder errors seen so far. They never stop verification.
    pub fn recorder_failures(&self) -> u64 {
        self.recorder_failures
    }

    /// Drains `receiver` until every sender is dropped, then flushes.
    pub async fn run(mut self, mut receiver: ReportReceiver) -> RunSummary {
        info!("Verifier consumer started");

        while let Some(report) = receiver.rx.recv().await {
            let matched = self.process(report) as u64;
            let mut stats = receiver.stats.write();
            stats.processed += 1;
            stats.matches += matched;
            stats.recorder_failures = self.recorder_failures;
        }

        debug!("Report queue closed, flushing");
        self.sink.flush();
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.flush() {
                error!("Failed to flush recorded reports: {}", e);
                self.recorder_failures += 1;
            }
        }
        receiver.stats.write().recorder_failures = self.recorder_failures;

        let stats = *receiver.stats.read();
        RunSummary {
            processed: stats.processed,
            matches: stats.matches,
            dropped: stats.dropped,
            recorder_failures: stats.recorder_failures,
            graph: self.engine.graph_stats(),
        }
    }
}
