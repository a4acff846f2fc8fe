//! # Telemetry Reports
//!
//! One report is emitted per packet observed at a probe. It carries the
//! concrete 5-tuple of the flow, the probe the packet was last seen at and
//! the probe that saw it now.
//!
//! Reports arrive as JSON lines:
//!
//! ```text
//! {"flow": {"src_addr": "10.0.0.5", "dst_addr": "10.0.1.9", "src_port": 1234,
//!  "dst_port": 80, "protocol": 6}, "prev_probe": 1, "probe": 2, "timestamp": 12.5}
//! ```
//!
//! A missing or `null` `prev_probe` is the ingress sentinel.

use policy_engine::{ProbeId, INGRESS_PROBE};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Concrete 5-tuple of an observed flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FlowKey {
    /// Source address as a host-order integer, for prefix comparison.
    #[inline]
    pub fn src_bits(&self) -> u32 {
        u32::from(self.src_addr)
    }

    #[inline]
    pub fn dst_bits(&self) -> u32 {
        u32::from(self.dst_addr)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto {}",
            self.src_addr, self.src_port, self.dst_addr, self.dst_port, self.protocol
        )
    }
}

/// A single packet-at-probe observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub flow: FlowKey,
    #[serde(default, deserialize_with = "ingress_if_null")]
    pub prev_probe: ProbeId,
    pub probe: ProbeId,
    pub timestamp: f64,
}

impl Report {
    pub fn new(flow: FlowKey, prev_probe: ProbeId, probe: ProbeId, timestamp: f64) -> Self {
        Report {
            flow,
            prev_probe,
            probe,
            timestamp,
        }
    }

    /// The `(prev_probe, probe)` transition this report evidences.
    #[inline]
    pub fn hop(&self) -> (ProbeId, ProbeId) {
        (self.prev_probe, self.probe)
    }

    /// True for a flow's first observed hop.
    pub fn is_ingress(&self) -> bool {
        self.prev_probe == INGRESS_PROBE
    }
}

fn ingress_if_null<'de, D>(deserializer: D) -> Result<ProbeId, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<ProbeId>::deserialize(deserializer)?.unwrap_or(INGRESS_PROBE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_from_json() {
        let line = r#"{"flow": {"src_addr": "10.0.0.5", "dst_addr": "10.0.1.9",
            "src_port": 1234, "dst_port": 80, "protocol": 6},
            "prev_probe": 1, "probe": 2, "timestamp": 12.5}"#;
        let report: Report = serde_json::from_str(line).unwrap();
        assert_eq!(report.flow.src_addr, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(report.flow.src_bits(), 0x0A00_0005);
        assert_eq!(report.hop(), (1, 2));
        assert_eq!(report.timestamp, 12.5);
        assert!(!report.is_ingress());
    }

    #[test]
    fn test_missing_or_null_prev_probe_is_ingress() {
        let flow = r#"{"src_addr": "10.0.0.5", "dst_addr": "10.0.1.9",
            "src_port": 1, "dst_port": 2, "protocol": 17}"#;

        let missing = format!(r#"{{"flow": {}, "probe": 4, "timestamp": 1.0}}"#, flow);
        let report: Report = serde_json::from_str(&missing).unwrap();
        assert!(report.is_ingress());
        assert_eq!(report.hop(), (INGRESS_PROBE, 4));

        let null = format!(
            r#"{{"flow": {}, "prev_probe": null, "probe": 4, "timestamp": 1.0}}"#,
            flow
        );
        let report: Report = serde_json::from_str(&null).unwrap();
        assert!(report.is_ingress());
    }

    #[test]
    fn test_out_of_range_port_is_rejected() {
        let line = r#"{"flow": {"src_addr": "10.0.0.5", "dst_addr": "10.0.1.9",
            "src_port": 70000, "dst_port": 80, "protocol": 6},
            "probe": 2, "timestamp": 0.0}"#;
        assert!(serde_json::from_str::<Report>(line).is_err());
    }
}
