//! # Path Verifier
//!
//! Streams probe telemetry through a live hop-adjacency graph and reports
//! every policy chain the observed transitions cover.
//!
//! Data flow: reports -> [`pipeline::ReportSender`] -> bounded queue ->
//! [`pipeline::Verifier`] (adjacency graph + [`engine::VerificationEngine`])
//! -> [`sink::MatchSink`].

pub mod adjacency;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod recorder;
pub mod sink;
pub mod source;
pub mod telemetry;

pub use adjacency::{AdjacencyGraph, GraphStats, RetentionPolicy};
pub use config::VerifierConfig;
pub use engine::{MatchEvent, VerificationEngine};
pub use error::{Result, VerifierError};
pub use pipeline::{
    channel, OverflowPolicy, PipelineStats, QueueConfig, ReportReceiver, ReportSender,
    RunSummary, SendOutcome, Verifier,
};
pub use recorder::{RecorderConfig, ReportRecorder};
pub use sink::{FanoutSink, JsonLinesSink, LogSink, MatchSink};
pub use source::SourceStats;
pub use telemetry::{FlowKey, Report};
