//! JSON-lines telemetry source.
//!
//! Reads one report per line and feeds the queue. Blank lines are skipped;
//! a line that does not decode, including one that is not valid UTF-8, is
//! logged and counted, never fatal.

use log::{debug, info, warn};
use std::io::{ErrorKind, Read};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::runtime::Handle;

use crate::error::Result;
use crate::pipeline::{ReportSender, SendOutcome};
use crate::telemetry::Report;

/// Counters for one pass over an input stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub lines: u64,
    pub forwarded: u64,
    pub malformed: u64,
    pub dropped: u64,
}

pub type Input = Box<dyn AsyncBufRead + Unpin + Send>;

/// Opens the telemetry input: the given file, or stdin when `None`.
pub async fn open_input(path: Option<&Path>) -> Result<Input> {
    match path {
        Some(path) => {
            let file = File::open(path).await?;
            info!("Reading telemetry from {}", path.display());
            Ok(Box::new(BufReader::new(file)))
        }
        None => {
            info!("Reading telemetry from stdin");
            detached(std::io::stdin())
        }
    }
}

const DETACHED_BUFFER: usize = 64 * 1024;

/// Reads a blocking source on a dedicated thread.
///
/// A read on `tokio::io::stdin` occupies the blocking pool and cannot be
/// cancelled, so an interrupted run would not shut down until the next line
/// arrived. A plain thread is abandoned at exit instead. Must be called from
/// within a runtime.
pub fn detached<R>(mut reader: R) -> Result<Input>
where
    R: Read + Send + 'static,
{
    let (mut writer, read_half) = tokio::io::duplex(DETACHED_BUFFER);
    let handle = Handle::current();

    std::thread::Builder::new()
        .name("telemetry-reader".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; DETACHED_BUFFER];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("Telemetry input read failed: {}", e);
                        break;
                    }
                };
                // Fails once the pump has dropped its end.
                if handle.block_on(writer.write_all(&buf[..n])).is_err() {
                    break;
                }
            }
        })?;

    Ok(Box::new(BufReader::new(read_half)))
}

/// Forwards every report in `reader` to `sender` until end of input.
///
/// Returns early with `QueueClosed` if the consumer has gone away.
pub async fn pump<R>(reader: R, sender: &ReportSender) -> Result<SourceStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = SourceStats::default();
    let mut lines = reader.split(b'\n');

    while let Some(line) = lines.next_segment().await? {
        stats.lines += 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let report: Report = match serde_json::from_slice(&line) {
            Ok(report) => report,
            Err(e) => {
                stats.malformed += 1;
                warn!("Skipping malformed report on line {}: {}", stats.lines, e);
                continue;
            }
        };

        match sender.send(report).await? {
            SendOutcome::Queued => stats.forwarded += 1,
            SendOutcome::Dropped => stats.dropped += 1,
        }
    }

    debug!(
        "End of telemetry input: {} lines, {} forwarded, {} malformed, {} dropped",
        stats.lines, stats.forwarded, stats.malformed, stats.dropped
    );
    Ok(stats)
}
