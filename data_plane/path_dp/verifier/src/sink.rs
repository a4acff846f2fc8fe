//! Match event sinks.
//!
//! The consumer task hands every match event to a [`MatchSink`]. Sinks are
//! owned by that task, so they take `&mut self` and need no locking.

use chrono::{DateTime, Utc};
use log::{error, info};
use serde::Serialize;
use std::io::Write;
use uuid::Uuid;

use crate::engine::MatchEvent;

pub trait MatchSink: Send {
    fn on_match(&mut self, event: &MatchEvent);

    /// Called once after the queue has been drained.
    fn flush(&mut self) {}
}

/// Logs one line per match.
#[derive(Debug, Default)]
pub struct LogSink;

impl MatchSink for LogSink {
    fn on_match(&mut self, event: &MatchEvent) {
        info!(
            "Flow {} matched {} path {} @ t = {}",
            event.flow, event.matcher, event.chain, event.timestamp
        );
    }
}

impl MatchSink for Vec<MatchEvent> {
    fn on_match(&mut self, event: &MatchEvent) {
        self.push(event.clone());
    }
}

/// Exported form of a match event.
#[derive(Debug, Serialize)]
struct MatchRecord<'a> {
    event_id: Uuid,
    emitted_at: DateTime<Utc>,
    matcher: String,
    chain: &'a [u32],
    flow: &'a crate::telemetry::FlowKey,
    timestamp: f64,
}

/// Writes one JSON object per match, newline-terminated.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
    written: u64,
    failures: u64,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            written: 0,
            failures: 0,
        }
    }

    /// Records successfully written.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_event(&mut self, event: &MatchEvent) -> crate::Result<()> {
        let record = MatchRecord {
            event_id: Uuid::new_v4(),
            emitted_at: Utc::now(),
            matcher: event.matcher.to_string(),
            chain: event.chain.probes(),
            flow: &event.flow,
            timestamp: event.timestamp,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write + Send> MatchSink for JsonLinesSink<W> {
    fn on_match(&mut self, event: &MatchEvent) {
        match self.write_event(event) {
            Ok(()) => self.written += 1,
            Err(e) => {
                self.failures += 1;
                error!("Failed to export match event: {}", e);
            }
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            error!("Failed to flush match export: {}", e);
        }
    }
}

/// Forwards every event to each inner sink in turn.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MatchSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MatchSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MatchSink for FanoutSink {
    fn on_match(&mut self, event: &MatchEvent) {
        for sink in &mut self.sinks {
            sink.on_match(event);
        }
    }

    fn flush(&mut self) {
        for sink in &mut self.sinks {
            sink.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::FlowKey;
    use policy_engine::{Chain, FlowMatcher, Prefix};
    use std::net::Ipv4Addr;

    fn event() -> MatchEvent {
        MatchEvent {
            matcher: FlowMatcher {
                src: Prefix::parse("10.0.0.0/24").unwrap(),
                dst: Prefix::parse("0.0.0.0/0").unwrap(),
                protocol: 6,
                src_port: 80,
                dst_port: 0,
            },
            chain: Chain::new(vec![1, 2, 3]),
            flow: FlowKey {
                src_addr: Ipv4Addr::new(10, 0, 0, 5),
                dst_addr: Ipv4Addr::new(10, 0, 1, 9),
                src_port: 1234,
                dst_port: 80,
                protocol: 6,
            },
            timestamp: 2.5,
        }
    }

    #[test]
    fn test_vec_sink_collects() {
        let mut sink: Vec<MatchEvent> = Vec::new();
        sink.on_match(&event());
        sink.on_match(&event());
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_json_lines_sink_output() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.on_match(&event());
        sink.on_match(&event());
        sink.flush();
        assert_eq!(sink.written(), 2);

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);

        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["matcher"], "(10.0.0.0/24, 0.0.0.0/0, 6, 80, 0)");
        assert_eq!(value["chain"], serde_json::json!([1, 2, 3]));
        assert_eq!(value["flow"]["src_addr"], "10.0.0.5");
        assert_eq!(value["timestamp"], 2.5);
        assert!(Uuid::parse_str(value["event_id"].as_str().unwrap()).is_ok());

        let other: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_ne!(value["event_id"], other["event_id"]);
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let mut sink = FanoutSink::new().with(LogSink).with(JsonLinesSink::new(Vec::new()));
        assert_eq!(sink.len(), 2);
        sink.on_match(&event());
        sink.flush();
    }
}
